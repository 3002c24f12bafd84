//! Dependency graph over declared resources.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

use crate::model::{Declaration, ResourceId, ResourceSpec};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("dependency cycle detected between: {}", join(.members))]
    Cycle { members: Vec<ResourceId> },
    #[error("{from} references {to}, which is not declared")]
    UnresolvedReference { from: ResourceId, to: ResourceId },
    #[error("resource {0} is declared more than once")]
    DuplicateResource(ResourceId),
    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),
}

fn join(ids: &[ResourceId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Validated, acyclic set of resources. Edges point from a dependency to
/// its dependent.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    specs: Vec<ResourceSpec>,
    graph: DiGraph<usize, ()>,
    index: HashMap<ResourceId, NodeIndex>,
    order: Vec<usize>,
}

impl ResourceGraph {
    /// Resolves count-0 declarations away, then builds the graph.
    pub fn from_declarations(decls: Vec<Declaration>) -> Result<Self, GraphError> {
        let mut specs = Vec::new();
        let mut disabled = Vec::new();
        for d in decls {
            let id = d.spec.id.clone();
            match d.resolve().map_err(GraphError::InvalidDeclaration)? {
                Some(spec) => specs.push(spec),
                None => disabled.push(id),
            }
        }
        if !disabled.is_empty() {
            tracing::debug!(count = disabled.len(), "skipping resources with count = 0");
        }
        Self::build(specs)
    }

    pub fn build(specs: Vec<ResourceSpec>) -> Result<Self, GraphError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for (i, spec) in specs.iter().enumerate() {
            if !spec.id.is_valid() {
                return Err(GraphError::InvalidDeclaration(format!(
                    "resource id '{}' must be type.name with letters, digits, '_' or '-' in each part",
                    spec.id
                )));
            }
            let ix = graph.add_node(i);
            if index.insert(spec.id.clone(), ix).is_some() {
                return Err(GraphError::DuplicateResource(spec.id.clone()));
            }
        }

        for spec in &specs {
            let to_ix = index[&spec.id];
            let targets = spec.depends_on.iter().chain(spec.references().into_iter().map(|r| &r.resource));
            for dep in targets {
                let from_ix = *index.get(dep).ok_or_else(|| GraphError::UnresolvedReference {
                    from: spec.id.clone(),
                    to: dep.clone(),
                })?;
                if graph.find_edge(from_ix, to_ix).is_none() {
                    graph.add_edge(from_ix, to_ix, ());
                }
            }
        }

        let order = stable_toposort(&graph).map_err(|members| GraphError::Cycle {
            members: members.into_iter().map(|i| specs[i].id.clone()).collect(),
        })?;
        Ok(Self { specs, graph, index, order })
    }

    /// Specs in topological order; ties keep declaration order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.order.iter().map(move |&i| &self.specs[i])
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceSpec> {
        self.index.get(id).map(|&ix| &self.specs[self.graph[ix]])
    }

    pub fn contains(&self, id: &ResourceId) -> bool { self.index.contains_key(id) }

    /// Direct dependencies of `id`, in declaration order.
    pub fn dependencies(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of `id`, in declaration order.
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &ResourceId, dir: Direction) -> Vec<&ResourceId> {
        let Some(&ix) = self.index.get(id) else { return Vec::new() };
        let mut found: Vec<usize> = self.graph.neighbors_directed(ix, dir).map(|n| self.graph[n]).collect();
        found.sort_unstable();
        found.into_iter().map(|i| &self.specs[i].id).collect()
    }

    pub fn len(&self) -> usize { self.specs.len() }

    pub fn is_empty(&self) -> bool { self.specs.is_empty() }
}

/// Kahn's algorithm with a min-heap on node weight, so independent nodes come
/// out in the order they were added. On a cycle, returns the weights of the
/// nodes that sit on one.
pub(crate) fn stable_toposort(graph: &DiGraph<usize, ()>) -> Result<Vec<usize>, Vec<usize>> {
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = graph
        .node_indices()
        .filter(|n| indegree[n.index()] == 0)
        .map(|n| Reverse((graph[n], n.index())))
        .collect();

    let mut out = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((weight, ix))) = ready.pop() {
        out.push(weight);
        for next in graph.neighbors_directed(NodeIndex::new(ix), Direction::Outgoing) {
            indegree[next.index()] -= 1;
            if indegree[next.index()] == 0 {
                ready.push(Reverse((graph[next], next.index())));
            }
        }
    }

    if out.len() == graph.node_count() {
        return Ok(out);
    }
    let mut members: Vec<usize> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.find_edge(scc[0], scc[0]).is_some())
        .flatten()
        .map(|n| graph[n])
        .collect();
    members.sort_unstable();
    Err(members)
}
