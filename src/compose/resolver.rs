//! Dependency resolution
//!
//! Startup order is a topological sort over the service arena with ties broken
//! by name. Since the arena is sorted by name, the smallest ready index is
//! always the alphabetically first ready service.

use super::topology::{ServiceId, Topology};
use crate::error::{BerthError, Result};
use std::collections::BTreeSet;

/// Adjacency lists over service indices
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// `dependencies[i]` are the services `i` waits for
    dependencies: Vec<Vec<ServiceId>>,
    /// `dependents[i]` are the services waiting for `i`
    dependents: Vec<Vec<ServiceId>>,
}

impl DependencyGraph {
    /// Build the graph from per-service dependency lists
    pub fn new(dependencies: Vec<Vec<ServiceId>>) -> Self {
        let mut dependents = vec![Vec::new(); dependencies.len()];
        for (i, deps) in dependencies.iter().enumerate() {
            for dep in deps {
                dependents[dep.0].push(ServiceId(i));
            }
        }

        Self {
            dependencies,
            dependents,
        }
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependencies(&self, id: ServiceId) -> &[ServiceId] {
        &self.dependencies[id.0]
    }

    /// Direct dependents of a service
    pub fn dependents(&self, id: ServiceId) -> &[ServiceId] {
        &self.dependents[id.0]
    }

    /// Every service that depends on `id`, directly or not, in index order
    pub fn transitive_dependents(&self, id: ServiceId) -> Vec<ServiceId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in &self.dependents[current.0] {
                if *dependent != id && seen.insert(*dependent) {
                    stack.push(*dependent);
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Kahn's algorithm; on a cycle returns the services on it
    pub fn sort(&self) -> std::result::Result<Vec<ServiceId>, Vec<ServiceId>> {
        let n = self.len();
        let mut remaining: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|i| remaining[*i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(next) = ready.pop_first() {
            order.push(ServiceId(next));
            for dependent in &self.dependents[next] {
                remaining[dependent.0] -= 1;
                if remaining[dependent.0] == 0 {
                    ready.insert(dependent.0);
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            let unresolved: Vec<bool> = remaining.iter().map(|r| *r > 0).collect();
            Err(self.cycle_members(&unresolved))
        }
    }

    /// Services that sit on a cycle: members of strongly connected components
    /// larger than one, or with an edge to themselves. Only unresolved nodes
    /// are considered; nodes merely downstream of a cycle are left out.
    fn cycle_members(&self, unresolved: &[bool]) -> Vec<ServiceId> {
        let n = self.len();
        let mut tarjan = Tarjan {
            graph: self,
            unresolved,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next_index: 0,
            members: BTreeSet::new(),
        };

        for v in 0..n {
            if unresolved[v] && tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }

        tarjan.members.into_iter().map(ServiceId).collect()
    }
}

struct Tarjan<'a> {
    graph: &'a DependencyGraph,
    unresolved: &'a [bool],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next_index: usize,
    members: BTreeSet<usize>,
}

impl Tarjan<'_> {
    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for w in self.graph.dependencies[v].iter().map(|w| w.0) {
            if !self.unresolved[w] {
                continue;
            }
            match self.index[w] {
                None => {
                    self.visit(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            let self_loop = self.graph.dependencies[v].iter().any(|d| d.0 == v);
            if component.len() > 1 || self_loop {
                self.members.extend(component);
            }
        }
    }
}

/// Startup order for a topology
pub fn order(topology: &Topology) -> Result<Vec<ServiceId>> {
    topology.graph().sort().map_err(|members| BerthError::Cycle {
        participants: members
            .into_iter()
            .map(|id| topology.service(id).name.clone())
            .collect(),
    })
}

/// Shutdown order: the exact reverse of [`order`]
pub fn reverse_order(topology: &Topology) -> Result<Vec<ServiceId>> {
    let mut order = order(topology)?;
    order.reverse();
    Ok(order)
}

/// Service names in startup order
pub fn order_names(topology: &Topology) -> Result<Vec<String>> {
    Ok(order(topology)?
        .into_iter()
        .map(|id| topology.service(id).name.clone())
        .collect())
}
