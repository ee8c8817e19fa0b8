//! Workflow validation.
//!
//! Runs once, before any step executes. A validation failure aborts the
//! run with zero side effects.

use std::collections::{HashMap, HashSet};

use super::types::Workflow;
use crate::error::{Error, Result};

/// Validate a workflow definition.
///
/// Checks, in order:
/// - every dependency name references an existing step
/// - the dependency graph contains no cycle (strongly-connected-component
///   analysis: any component with more than one member, or a self-loop,
///   is rejected)
pub fn validate(workflow: &Workflow) -> Result<()> {
    for (name, step) in &workflow.steps {
        for dep in &step.depends_on {
            if !workflow.steps.contains_key(dep) {
                return Err(Error::MissingDependency {
                    step: name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(names) = find_cycle(workflow) {
        return Err(Error::CircularDependency { names });
    }

    Ok(())
}

/// Find one cycle in the dependency graph, if any.
///
/// Edges run dependency -> dependent. Returns the members of the first
/// offending strongly connected component, sorted by name.
fn find_cycle(workflow: &Workflow) -> Option<Vec<String>> {
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, step) in &workflow.steps {
        graph.entry(name.as_str()).or_default();
        for dep in &step.depends_on {
            graph.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut tarjan = Tarjan {
        graph: &graph,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        next_index: 0,
        cycle: None,
    };

    for name in workflow.steps.keys() {
        if !tarjan.index.contains_key(name.as_str()) {
            tarjan.strongconnect(name.as_str());
        }
        if tarjan.cycle.is_some() {
            break;
        }
    }

    tarjan.cycle
}

struct Tarjan<'a> {
    graph: &'a HashMap<&'a str, Vec<&'a str>>,
    index: HashMap<&'a str, usize>,
    lowlink: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
    on_stack: HashSet<&'a str>,
    next_index: usize,
    cycle: Option<Vec<String>>,
}

impl<'a> Tarjan<'a> {
    fn strongconnect(&mut self, v: &'a str) {
        self.index.insert(v, self.next_index);
        self.lowlink.insert(v, self.next_index);
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack.insert(v);

        let graph = self.graph;
        let neighbors = graph.get(v).map(|n| n.as_slice()).unwrap_or(&[]);
        for &w in neighbors {
            if !self.index.contains_key(w) {
                self.strongconnect(w);
                let low = self.lowlink[w].min(self.lowlink[v]);
                self.lowlink.insert(v, low);
            } else if self.on_stack.contains(w) {
                let low = self.index[w].min(self.lowlink[v]);
                self.lowlink.insert(v, low);
            }
        }

        if self.lowlink[v] == self.index[v] {
            let mut component = Vec::new();
            loop {
                let w = self.stack.pop().unwrap();
                self.on_stack.remove(w);
                component.push(w);
                if w == v {
                    break;
                }
            }

            let self_loop = component.len() == 1
                && self.graph.get(v).is_some_and(|n| n.contains(&v));
            if (component.len() > 1 || self_loop) && self.cycle.is_none() {
                let mut names: Vec<String> = component.iter().map(|s| s.to_string()).collect();
                names.sort();
                self.cycle = Some(names);
            }
        }
    }
}
