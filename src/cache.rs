//! Step result caching.
//!
//! Memoizes step results by (step name, assembled inputs). Entries live as
//! one JSON file per key under the configured directory, fronted by an
//! in-memory map. Without a configured directory every lookup misses and
//! every store is silently dropped; that is a deliberate no-op, not an
//! error. Entries are never invalidated automatically; staleness is the
//! caller's responsibility.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::workflow::types::{DataMap, StepResult};

/// Cache for memoized step results.
pub struct StepCache {
    dir: Option<PathBuf>,
    memory: RwLock<HashMap<String, StepResult>>,
}

impl StepCache {
    /// Create a cache backed by `dir`, or a no-op cache when None.
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            memory: RwLock::new(HashMap::new()),
        }
    }

    /// Create a cache that always misses.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether a backing directory is configured.
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Compute the deterministic cache key for a step invocation.
    ///
    /// `DataMap` keeps keys sorted, so equal inputs serialize to equal
    /// bytes regardless of insertion order.
    pub fn key(step_name: &str, inputs: &DataMap) -> String {
        let mut hasher = Sha256::new();
        hasher.update(step_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(inputs).unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    /// Look up a cached result. Always misses when no directory is
    /// configured.
    pub fn lookup(&self, key: &str) -> Option<StepResult> {
        let dir = self.dir.as_ref()?;

        if let Some(hit) = self.memory.read().unwrap().get(key) {
            return Some(hit.clone());
        }

        let path = entry_path(dir, key);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(_) => return None,
        };
        match serde_json::from_str::<StepResult>(&json) {
            Ok(result) => {
                self.memory
                    .write()
                    .unwrap()
                    .insert(key.to_string(), result.clone());
                Some(result)
            }
            Err(e) => {
                debug!("Discarding unreadable cache entry {:?}: {}", path, e);
                None
            }
        }
    }

    /// Store a result under a key. Silently dropped when no directory is
    /// configured; a write failure is reported but never fails the step.
    pub fn store(&self, key: &str, result: &StepResult) {
        let Some(dir) = self.dir.as_ref() else {
            return;
        };

        self.memory
            .write()
            .unwrap()
            .insert(key.to_string(), result.clone());

        if let Err(e) = write_entry(dir, key, result) {
            warn!("Failed to write cache entry {}: {}", key, e);
        }
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn write_entry(dir: &Path, key: &str, result: &StepResult) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = entry_path(dir, key);
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(result).unwrap_or_default())?;
    fs::rename(&tmp, &path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, serde_json::Value)]) -> DataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_key_is_deterministic_and_input_sensitive() {
        let a = inputs(&[("x", json!(1)), ("y", json!(2))]);
        let b = inputs(&[("y", json!(2)), ("x", json!(1))]); // insertion order differs
        let c = inputs(&[("x", json!(1)), ("y", json!(3))]);

        assert_eq!(StepCache::key("step", &a), StepCache::key("step", &b));
        assert_ne!(StepCache::key("step", &a), StepCache::key("step", &c));
        assert_ne!(StepCache::key("step", &a), StepCache::key("other", &a));
    }

    #[test]
    fn test_disabled_cache_misses_and_drops() {
        let cache = StepCache::disabled();
        let key = StepCache::key("step", &DataMap::new());

        cache.store(&key, &StepResult::of("n", json!(1)));
        assert!(cache.lookup(&key).is_none());
    }

    #[test]
    fn test_roundtrip_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = StepCache::key("step", &inputs(&[("x", json!(1))]));
        let result = StepResult::of("n", json!(42));

        let cache = StepCache::new(Some(dir.path().to_path_buf()));
        cache.store(&key, &result);

        // Fresh instance: memory layer is cold, entry comes off disk.
        let reopened = StepCache::new(Some(dir.path().to_path_buf()));
        let hit = reopened.lookup(&key).unwrap();
        assert_eq!(hit.output.get("n"), Some(&json!(42)));
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let key = StepCache::key("step", &DataMap::new());
        fs::write(entry_path(dir.path(), &key), b"not json").unwrap();

        let cache = StepCache::new(Some(dir.path().to_path_buf()));
        assert!(cache.lookup(&key).is_none());
    }
}
