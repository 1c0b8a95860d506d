//! Explicit resource dependency graph.
//!
//! Nodes are resource addresses. An edge `producer -> consumer` means the
//! producer must reach a terminal success before the consumer is dispatched.
//! Each edge records why it exists (data reference, explicit ordering or
//! both) and the field paths that induced it.

mod dot;
mod ordering;
mod resolver;
mod validate;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::Serialize;

use crate::declaration::{Address, Declaration, Variables};
use crate::error::ConfigError;

pub use dot::render_dot;
pub use ordering::merge_ordering;
pub use resolver::resolve_references;
pub use validate::{realize, RealizedGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeReason {
    Data,
    Ordering,
}

impl fmt::Display for EdgeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeReason::Data => f.write_str("data"),
            EdgeReason::Ordering => f.write_str("ordering"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EdgeInfo {
    pub reasons: BTreeSet<EdgeReason>,
    /// Field paths (or `depends_on` paths) that induced this edge.
    pub paths: BTreeSet<String>,
}

impl EdgeInfo {
    pub fn has(&self, reason: EdgeReason) -> bool {
        self.reasons.contains(&reason)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeSet<Address>,
    /// Keyed by `(producer, consumer)`.
    edges: BTreeMap<(Address, Address), EdgeInfo>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the merged reference and ordering graph of a declaration.
    pub fn build(declaration: &Declaration) -> Result<Self, ConfigError> {
        let mut graph = resolve_references(declaration)?;
        merge_ordering(&mut graph, declaration)?;
        Ok(graph)
    }

    /// Build, prune and validate in one step.
    pub fn realize(
        declaration: &Declaration,
        variables: &Variables,
    ) -> Result<RealizedGraph, ConfigError> {
        realize(declaration, Self::build(declaration)?, variables)
    }

    pub fn add_node(&mut self, address: Address) {
        self.nodes.insert(address);
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.contains(address)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Address> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add or extend the edge `producer -> consumer`. Repeating an edge only
    /// accumulates its reasons and paths.
    pub fn add_edge(
        &mut self,
        producer: &Address,
        consumer: &Address,
        reason: EdgeReason,
        path: impl Into<String>,
    ) {
        self.nodes.insert(producer.clone());
        self.nodes.insert(consumer.clone());
        let info = self
            .edges
            .entry((producer.clone(), consumer.clone()))
            .or_default();
        info.reasons.insert(reason);
        info.paths.insert(path.into());
    }

    pub fn edge(&self, producer: &Address, consumer: &Address) -> Option<&EdgeInfo> {
        self.edges.get(&(producer.clone(), consumer.clone()))
    }

    pub fn edges(&self) -> impl Iterator<Item = (&Address, &Address, &EdgeInfo)> {
        self.edges.iter().map(|((p, c), info)| (p, c, info))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Direct dependencies of `address`.
    pub fn producers(&self, address: &Address) -> BTreeSet<Address> {
        self.edges
            .keys()
            .filter(|(_, c)| c == address)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Direct dependents of `address`.
    pub fn consumers(&self, address: &Address) -> BTreeSet<Address> {
        self.edges
            .keys()
            .filter(|(p, _)| p == address)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, address: &Address) {
        self.nodes.remove(address);
        self.edges.retain(|(p, c), _| p != address && c != address);
    }

    /// The same graph with every edge flipped, used for teardown.
    pub fn reversed(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            edges: self
                .edges
                .iter()
                .map(|((p, c), info)| ((c.clone(), p.clone()), info.clone()))
                .collect(),
        }
    }

    fn adjacency(&self) -> BTreeMap<&Address, Vec<&Address>> {
        let mut out: BTreeMap<&Address, Vec<&Address>> =
            self.nodes.iter().map(|n| (n, Vec::new())).collect();
        for (p, c) in self.edges.keys() {
            if let Some(list) = out.get_mut(p) {
                list.push(c);
            }
        }
        out
    }

    /// Depth-first search with an on-stack marker. Returns the full cycle
    /// path, first node repeated at the end, if one exists.
    pub fn find_cycle(&self) -> Option<Vec<Address>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn dfs<'a>(
            node: &'a Address,
            out: &BTreeMap<&'a Address, Vec<&'a Address>>,
            marks: &mut BTreeMap<&'a Address, Mark>,
            stack: &mut Vec<&'a Address>,
        ) -> Option<Vec<Address>> {
            marks.insert(node, Mark::OnStack);
            stack.push(node);

            for &next in out.get(node).map(Vec::as_slice).unwrap_or_default() {
                match marks.get(next).copied().unwrap_or(Mark::Unvisited) {
                    Mark::Unvisited => {
                        if let Some(cycle) = dfs(next, out, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<Address> =
                            stack[start..].iter().map(|&a| a.clone()).collect();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let out = self.adjacency();
        let mut marks = BTreeMap::new();
        let mut stack = Vec::new();
        for node in &self.nodes {
            if marks.get(node).copied().unwrap_or(Mark::Unvisited) != Mark::Unvisited {
                continue;
            }
            if let Some(cycle) = dfs(node, &out, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    /// Kahn topological order, ties broken by address.
    pub fn topo_order(&self) -> Result<Vec<Address>, ConfigError> {
        let mut indegree: BTreeMap<&Address, usize> = self.nodes.iter().map(|n| (n, 0)).collect();
        for (_, c) in self.edges.keys() {
            if let Some(d) = indegree.get_mut(c) {
                *d += 1;
            }
        }
        let out = self.adjacency();

        let mut queue: VecDeque<&Address> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.clone());
            for &next in out.get(node).map(Vec::as_slice).unwrap_or_default() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }
        Err(ConfigError::Cycle {
            cycle: self.find_cycle().unwrap_or_default(),
        })
    }
}
