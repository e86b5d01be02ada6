//! Subgraph queries.
//!
//! Breadth-first traversal from a root vertex, collecting the vertices that
//! match a [`QueryMatcher`]. Matching does not gate traversal: the search
//! walks through non-matching vertices so that matches further out are still
//! found. Tombstoned vertices are walked through the same way but are only
//! returned with `include_deleted`; tombstoned edges are never followed
//! unless `include_deleted` is set. The result is the induced subgraph over
//! the matched vertices.

use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::error::{GraphError, Result};
use crate::graph::{GraphStore, PropertyGraph};
use crate::matcher::QueryMatcher;

/// Structural query algorithms over a [`PropertyGraph`].
pub trait GraphAlgorithm {
    /// Vertices within `depth` hops of `root_id` matching `matcher`, plus
    /// every edge between two of them, as an independent graph.
    ///
    /// `depth == None` means unbounded; `Some(0)` considers only the root.
    fn query_vertices(
        &self,
        matcher: &QueryMatcher,
        root_id: &str,
        depth: Option<usize>,
    ) -> Result<PropertyGraph>;
}

/// Breadth-first implementation of [`GraphAlgorithm`].
#[derive(Debug, Clone, Copy)]
pub struct BfsAlgorithm<'g> {
    graph: &'g PropertyGraph,
    include_deleted: bool,
}

impl PropertyGraph {
    /// Query engine bound to this graph.
    pub fn algo(&self) -> BfsAlgorithm<'_> {
        BfsAlgorithm {
            graph: self,
            include_deleted: false,
        }
    }
}

impl<'g> BfsAlgorithm<'g> {
    /// Also return tombstoned vertices and follow tombstoned edges.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    fn traverse(
        &self,
        store: &GraphStore,
        matcher: &QueryMatcher,
        root_id: &str,
        depth: Option<usize>,
    ) -> Result<BTreeSet<String>> {
        let root = store
            .vertices
            .get(root_id)
            .filter(|v| self.include_deleted || !v.is_deleted)
            .ok_or_else(|| GraphError::vertex_not_found(root_id))?;

        let mut matched = BTreeSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(root.id.as_str());

        // BFS queue: (vertex_id, hops from root)
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        queue.push_back((root.id.as_str(), 0));

        while let Some((id, hops)) = queue.pop_front() {
            let Some(vertex) = store.vertices.get(id) else {
                continue;
            };
            // Tombstoned vertices still connect their neighbours.
            if (self.include_deleted || !vertex.is_deleted) && matcher.matches(vertex) {
                matched.insert(vertex.id.clone());
            }

            if depth.is_some_and(|max| hops >= max) {
                continue;
            }

            for edge in store.incident_edges(id, self.include_deleted) {
                let Some(next) = edge.key.other_end(id) else {
                    continue;
                };
                if store.vertices.contains_key(next) && visited.insert(next) {
                    queue.push_back((next, hops + 1));
                }
            }
        }

        Ok(matched)
    }
}

impl GraphAlgorithm for BfsAlgorithm<'_> {
    fn query_vertices(
        &self,
        matcher: &QueryMatcher,
        root_id: &str,
        depth: Option<usize>,
    ) -> Result<PropertyGraph> {
        // One read guard for the whole query keeps the result consistent.
        let store = self.graph.read()?;
        let matched = self.traverse(&store, matcher, root_id, depth)?;

        let mut sub = GraphStore::default();
        for id in &matched {
            if let Some(vertex) = store.vertices.get(id) {
                sub.vertices.insert(id.clone(), vertex.clone());
                sub.adjacency.entry(id.clone()).or_default();
            }
            for edge in store.incident_edges(id, self.include_deleted) {
                if matched.contains(&edge.key.source_id) && matched.contains(&edge.key.target_id)
                {
                    sub.edges.insert(edge.key.clone(), edge.clone());
                    sub.adjacency
                        .entry(id.clone())
                        .or_default()
                        .insert(edge.key.clone());
                }
            }
        }

        tracing::debug!(
            graph = %self.graph.name(),
            root = %root_id,
            depth = ?depth,
            vertices = sub.vertices.len(),
            edges = sub.edges.len(),
            "Subgraph query complete"
        );

        Ok(PropertyGraph::from_store(
            format!("{}-subgraph", self.graph.name()),
            sub,
            self.graph.lock_timeout(),
        ))
    }
}
