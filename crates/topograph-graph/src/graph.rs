//! The in-memory property graph.
//!
//! All mutations run under an exclusive lock that also covers the
//! before/after snapshot and the notifier dispatch, so readers never see a
//! half-applied change. Reads take a shared lock. Every lock acquisition is
//! bounded by `GraphConfig::lock_timeout`.
//!
//! Deletion is logical: a tombstoned item keeps its identity and data until
//! a later [`PropertyGraph::compact`] pass removes it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use serde_json::Value;

use topograph_core::{Edge, EdgeKey, Item, ItemId, Vertex};

use crate::error::{GraphError, Result};
use crate::notifier::Notifier;

/// Tuning for a graph instance.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Upper bound on any single lock acquisition.
    pub lock_timeout: Duration,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Raw vertex/edge storage. Only reachable through the graph's lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct GraphStore {
    pub(crate) vertices: BTreeMap<String, Vertex>,
    pub(crate) edges: BTreeMap<EdgeKey, Edge>,
    /// Incident edge keys per vertex, both directions.
    pub(crate) adjacency: BTreeMap<String, BTreeSet<EdgeKey>>,
}

impl GraphStore {
    fn get(&self, id: &ItemId) -> Option<Item> {
        match id {
            ItemId::Vertex { id } => self.vertices.get(id).cloned().map(Item::Vertex),
            ItemId::Edge { key } => self.edges.get(key).cloned().map(Item::Edge),
        }
    }

    fn put_vertex(&mut self, vertex: Vertex) {
        self.adjacency.entry(vertex.id.clone()).or_default();
        self.vertices.insert(vertex.id.clone(), vertex);
    }

    fn check_endpoints(&self, key: &EdgeKey) -> Result<()> {
        for endpoint in [&key.source_id, &key.target_id] {
            if !self.vertices.contains_key(endpoint) {
                return Err(GraphError::DanglingReference {
                    edge: key.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        Ok(())
    }

    fn put_edge(&mut self, edge: Edge) {
        let key = edge.key.clone();
        self.adjacency
            .entry(key.source_id.clone())
            .or_default()
            .insert(key.clone());
        self.adjacency
            .entry(key.target_id.clone())
            .or_default()
            .insert(key.clone());
        self.edges.insert(key, edge);
    }

    fn remove_edge(&mut self, key: &EdgeKey) {
        self.edges.remove(key);
        for endpoint in [&key.source_id, &key.target_id] {
            if let Some(incident) = self.adjacency.get_mut(endpoint) {
                incident.remove(key);
            }
        }
    }

    /// Incident edges of `vertex_id` that are usable for traversal.
    pub(crate) fn incident_edges<'a>(
        &'a self,
        vertex_id: &str,
        include_deleted: bool,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.adjacency
            .get(vertex_id)
            .into_iter()
            .flatten()
            .filter_map(|key| self.edges.get(key))
            .filter(move |edge| include_deleted || !edge.is_deleted)
    }
}

/// Result of a compaction pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionSummary {
    pub vertices_removed: usize,
    pub edges_removed: usize,
}

/// The shared, thread-safe topology graph.
#[derive(Debug)]
pub struct PropertyGraph {
    name: String,
    store: RwLock<GraphStore>,
    notifier: Notifier,
    lock_timeout: Duration,
}

impl PropertyGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, GraphConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: GraphConfig) -> Self {
        Self {
            name: name.into(),
            store: RwLock::new(GraphStore::default()),
            notifier: Notifier::new(),
            lock_timeout: config.lock_timeout,
        }
    }

    pub(crate) fn from_store(
        name: impl Into<String>,
        store: GraphStore,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store: RwLock::new(store),
            notifier: Notifier::new(),
            lock_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, GraphStore>> {
        self.store
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| self.lock_timeout_error())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, GraphStore>> {
        self.store
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.lock_timeout_error())
    }

    fn lock_timeout_error(&self) -> GraphError {
        tracing::warn!(graph = %self.name, "Graph lock acquisition timed out");
        GraphError::LockTimeout {
            timeout_ms: self.lock_timeout.as_millis() as u64,
        }
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Register a change subscriber. See [`Notifier`] for the contract.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Option<&Item>, &Item) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback);
    }

    pub fn is_subscribed(&self) -> bool {
        self.notifier.is_subscribed()
    }

    /// Run `op` under the write lock and dispatch one notification if the
    /// item it returns differs from what `id` held before.
    fn mutate<T, F>(&self, id: &ItemId, op: F) -> Result<T>
    where
        T: Clone + Into<Item>,
        F: FnOnce(&mut GraphStore) -> Result<T>,
    {
        let mut store = self.write()?;
        let subscribed = self.notifier.is_subscribed();
        let prev = if subscribed { store.get(id) } else { None };

        let curr = op(&mut store)?;

        if subscribed {
            let curr_item: Item = curr.clone().into();
            if prev.as_ref() != Some(&curr_item) {
                self.notifier.notify(prev.as_ref(), &curr_item);
            }
        }
        Ok(curr)
    }

    // ── Vertices ─────────────────────────────────────────────────

    /// Insert or wholesale replace a vertex.
    pub fn add_vertex(&self, vertex: Vertex) -> Result<Vertex> {
        let id = ItemId::Vertex {
            id: vertex.id.clone(),
        };
        self.mutate(&id, |store| {
            store.put_vertex(vertex.clone());
            Ok(vertex)
        })
    }

    /// Insert a vertex that must not exist yet.
    pub fn insert_vertex(&self, vertex: Vertex) -> Result<Vertex> {
        let id = ItemId::Vertex {
            id: vertex.id.clone(),
        };
        self.mutate(&id, |store| {
            if store.vertices.contains_key(&vertex.id) {
                return Err(GraphError::Conflict(id.clone()));
            }
            store.put_vertex(vertex.clone());
            Ok(vertex)
        })
    }

    /// Upsert that merges into an existing vertex instead of replacing it.
    ///
    /// Incoming properties overwrite existing keys, a `null` value removes
    /// the key, and keys not mentioned are kept. Typed optional fields are
    /// only overwritten when the incoming value is set. A tombstoned vertex
    /// is revived.
    ///
    /// An incoming vertex older than the stored one's last change is
    /// ignored and the stored vertex is returned unchanged.
    pub fn merge_vertex(&self, vertex: Vertex) -> Result<Vertex> {
        let id = ItemId::Vertex {
            id: vertex.id.clone(),
        };
        self.mutate(&id, |store| {
            let merged = match store.vertices.get(&vertex.id) {
                Some(existing) if existing.last_changed() > vertex.timestamp => {
                    tracing::debug!(
                        graph = %self.name,
                        vertex = %vertex.id,
                        "Ignoring out-of-date vertex update"
                    );
                    return Ok(existing.clone());
                }
                Some(existing) => merge_into(existing.clone(), vertex),
                None => {
                    let mut fresh = vertex;
                    fresh.properties.retain(|_, v| !v.is_null());
                    fresh
                }
            };
            store.put_vertex(merged.clone());
            Ok(merged)
        })
    }

    /// Apply `mutator` to an existing vertex. The vertex id must not change.
    pub fn update_vertex<F>(&self, id: &str, mutator: F) -> Result<Vertex>
    where
        F: FnOnce(&mut Vertex),
    {
        let item_id = ItemId::Vertex { id: id.to_string() };
        self.mutate(&item_id, |store| {
            let current = store
                .vertices
                .get_mut(id)
                .ok_or_else(|| GraphError::vertex_not_found(id))?;
            let mut updated = current.clone();
            mutator(&mut updated);
            if updated.id != id {
                return Err(GraphError::InvalidMutation(item_id.clone()));
            }
            *current = updated.clone();
            Ok(updated)
        })
    }

    /// Tombstone a vertex. Calling it again changes nothing.
    ///
    /// Incident edges are left untouched and keep pointing at the tombstone.
    pub fn delete_vertex(&self, id: &str) -> Result<Vertex> {
        self.tombstone_vertex(id, |_| true).map(|(vertex, _)| vertex)
    }

    /// Tombstone a vertex only if it is live and was last updated at or
    /// before `cutoff`, checked under the same lock as the deletion. Returns the
    /// tombstoned copy, or `None` if the vertex was refreshed meanwhile.
    pub fn delete_vertex_if_stale(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Vertex>> {
        let (vertex, deleted) = self.tombstone_vertex(id, |v| v.timestamp <= cutoff)?;
        Ok(deleted.then_some(vertex))
    }

    /// Tombstone a vertex on behalf of a deletion observed at `at`. A vertex
    /// updated after `at` is left alone and `None` is returned.
    pub fn delete_vertex_as_of(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Vertex>> {
        let (vertex, deleted) = self.tombstone_vertex(id, |v| v.timestamp <= at)?;
        Ok(deleted.then_some(vertex))
    }

    fn tombstone_vertex<P>(&self, id: &str, should_delete: P) -> Result<(Vertex, bool)>
    where
        P: FnOnce(&Vertex) -> bool,
    {
        let item_id = ItemId::Vertex { id: id.to_string() };
        let mut deleted = false;
        let vertex = self.mutate(&item_id, |store| {
            let vertex = store
                .vertices
                .get_mut(id)
                .ok_or_else(|| GraphError::vertex_not_found(id))?;
            if !vertex.is_deleted && should_delete(&*vertex) {
                deleted = vertex.mark_deleted(Utc::now());
                tracing::debug!(graph = %self.name, vertex = %id, "Vertex tombstoned");
            }
            Ok(vertex.clone())
        })?;
        Ok((vertex, deleted))
    }

    pub fn get_vertex(&self, id: &str) -> Result<Option<Vertex>> {
        Ok(self.read()?.vertices.get(id).cloned())
    }

    // ── Edges ────────────────────────────────────────────────────

    /// Insert or wholesale replace an edge. Both endpoints must exist.
    pub fn add_edge(&self, edge: Edge) -> Result<Edge> {
        let id = ItemId::from(edge.key.clone());
        self.mutate(&id, |store| {
            store.check_endpoints(&edge.key)?;
            store.put_edge(edge.clone());
            Ok(edge)
        })
    }

    /// Upsert an edge unless the stored copy changed after `edge.timestamp`,
    /// in which case the stored copy is returned unchanged.
    pub fn merge_edge(&self, edge: Edge) -> Result<Edge> {
        let id = ItemId::from(edge.key.clone());
        self.mutate(&id, |store| {
            if let Some(existing) = store.edges.get(&edge.key) {
                if existing.last_changed() > edge.timestamp {
                    tracing::debug!(
                        graph = %self.name,
                        edge = %edge.key,
                        "Ignoring out-of-date edge update"
                    );
                    return Ok(existing.clone());
                }
            }
            store.check_endpoints(&edge.key)?;
            store.put_edge(edge.clone());
            Ok(edge)
        })
    }

    /// Insert an edge that must not exist yet. Both endpoints must exist.
    pub fn insert_edge(&self, edge: Edge) -> Result<Edge> {
        let id = ItemId::from(edge.key.clone());
        self.mutate(&id, |store| {
            if store.edges.contains_key(&edge.key) {
                return Err(GraphError::Conflict(id.clone()));
            }
            store.check_endpoints(&edge.key)?;
            store.put_edge(edge.clone());
            Ok(edge)
        })
    }

    /// Apply `mutator` to an existing edge. The edge key must not change.
    pub fn update_edge<F>(&self, key: &EdgeKey, mutator: F) -> Result<Edge>
    where
        F: FnOnce(&mut Edge),
    {
        let item_id = ItemId::from(key.clone());
        self.mutate(&item_id, |store| {
            let current = store
                .edges
                .get_mut(key)
                .ok_or_else(|| GraphError::edge_not_found(key))?;
            let mut updated = current.clone();
            mutator(&mut updated);
            if &updated.key != key {
                return Err(GraphError::InvalidMutation(item_id.clone()));
            }
            *current = updated.clone();
            Ok(updated)
        })
    }

    /// Tombstone an edge. Calling it again changes nothing.
    pub fn delete_edge(&self, key: &EdgeKey) -> Result<Edge> {
        self.tombstone_edge(key, |_| true).map(|(edge, _)| edge)
    }

    /// Edge counterpart of [`PropertyGraph::delete_vertex_if_stale`].
    pub fn delete_edge_if_stale(
        &self,
        key: &EdgeKey,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Edge>> {
        let (edge, deleted) = self.tombstone_edge(key, |e| e.timestamp <= cutoff)?;
        Ok(deleted.then_some(edge))
    }

    fn tombstone_edge<P>(&self, key: &EdgeKey, should_delete: P) -> Result<(Edge, bool)>
    where
        P: FnOnce(&Edge) -> bool,
    {
        let item_id = ItemId::from(key.clone());
        let mut deleted = false;
        let edge = self.mutate(&item_id, |store| {
            let edge = store
                .edges
                .get_mut(key)
                .ok_or_else(|| GraphError::edge_not_found(key))?;
            if !edge.is_deleted && should_delete(&*edge) {
                deleted = edge.mark_deleted(Utc::now());
                tracing::debug!(graph = %self.name, edge = %key, "Edge tombstoned");
            }
            Ok(edge.clone())
        })?;
        Ok((edge, deleted))
    }

    pub fn get_edge(&self, key: &EdgeKey) -> Result<Option<Edge>> {
        Ok(self.read()?.edges.get(key).cloned())
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Owned copy of any item; changing it never affects the graph.
    pub fn get_item(&self, id: &ItemId) -> Result<Option<Item>> {
        Ok(self.read()?.get(id))
    }

    /// Count of stored vertices, tombstones included.
    pub fn vertex_count(&self) -> Result<usize> {
        Ok(self.read()?.vertices.len())
    }

    /// Count of stored edges, tombstones included.
    pub fn edge_count(&self) -> Result<usize> {
        Ok(self.read()?.edges.len())
    }

    /// All vertices ordered by id, tombstones included.
    pub fn vertices(&self) -> Result<Vec<Vertex>> {
        Ok(self.read()?.vertices.values().cloned().collect())
    }

    /// All edges ordered by key, tombstones included.
    pub fn edges(&self) -> Result<Vec<Edge>> {
        Ok(self.read()?.edges.values().cloned().collect())
    }

    /// Ids of every stored vertex, in order.
    pub fn vertex_ids(&self) -> Result<Vec<String>> {
        Ok(self.read()?.vertices.keys().cloned().collect())
    }

    /// Edges touching `id` in either direction, live or tombstoned.
    pub fn edges_of(&self, id: &str) -> Result<Vec<Edge>> {
        let store = self.read()?;
        if !store.vertices.contains_key(id) {
            return Err(GraphError::vertex_not_found(id));
        }
        Ok(store.incident_edges(id, true).cloned().collect())
    }

    /// Live vertices one live edge away from `id`.
    pub fn neighbors(&self, id: &str) -> Result<Vec<Vertex>> {
        let store = self.read()?;
        if !store.vertices.contains_key(id) {
            return Err(GraphError::vertex_not_found(id));
        }
        let ids: BTreeSet<&str> = store
            .incident_edges(id, false)
            .filter_map(|edge| edge.key.other_end(id))
            .collect();
        Ok(ids
            .into_iter()
            .filter_map(|n| store.vertices.get(n))
            .filter(|v| !v.is_deleted)
            .cloned()
            .collect())
    }

    // ── Consistency support ──────────────────────────────────────

    /// Live vertices last updated at or before `cutoff`.
    pub fn stale_vertices(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .vertices
            .values()
            .filter(|v| !v.is_deleted && v.timestamp <= cutoff)
            .map(|v| v.id.clone())
            .collect())
    }

    /// Live edges last updated at or before `cutoff`.
    pub fn stale_edges(&self, cutoff: DateTime<Utc>) -> Result<Vec<EdgeKey>> {
        Ok(self
            .read()?
            .edges
            .values()
            .filter(|e| !e.is_deleted && e.timestamp <= cutoff)
            .map(|e| e.key.clone())
            .collect())
    }

    /// Physically remove tombstones deleted before `cutoff`.
    ///
    /// Edges incident to a removed vertex are removed with it, live or not,
    /// so no dangling edge survives. Compaction is not a logical change and
    /// does not notify subscribers.
    pub fn compact(&self, cutoff: DateTime<Utc>) -> Result<CompactionSummary> {
        let mut store = self.write()?;
        let expired = |deleted: bool, at: Option<DateTime<Utc>>| {
            deleted && at.is_some_and(|ts| ts < cutoff)
        };

        let doomed_vertices: Vec<String> = store
            .vertices
            .values()
            .filter(|v| expired(v.is_deleted, v.deletion_timestamp))
            .map(|v| v.id.clone())
            .collect();

        let mut doomed_edges: BTreeSet<EdgeKey> = store
            .edges
            .values()
            .filter(|e| expired(e.is_deleted, e.deletion_timestamp))
            .map(|e| e.key.clone())
            .collect();
        for id in &doomed_vertices {
            if let Some(incident) = store.adjacency.get(id) {
                doomed_edges.extend(incident.iter().cloned());
            }
        }

        for key in &doomed_edges {
            store.remove_edge(key);
        }
        for id in &doomed_vertices {
            store.vertices.remove(id);
            store.adjacency.remove(id);
        }

        let summary = CompactionSummary {
            vertices_removed: doomed_vertices.len(),
            edges_removed: doomed_edges.len(),
        };
        if summary != CompactionSummary::default() {
            tracing::info!(
                graph = %self.name,
                vertices = summary.vertices_removed,
                edges = summary.edges_removed,
                "Compacted tombstones"
            );
        }
        Ok(summary)
    }

    // ── Snapshots ────────────────────────────────────────────────

    /// Independent deep copy without subscribers.
    pub fn snapshot(&self) -> Result<PropertyGraph> {
        let store = self.read()?.clone();
        Ok(Self::from_store(
            format!("{}-snapshot", self.name),
            store,
            self.lock_timeout,
        ))
    }

    /// JSON dump for external persistence consumers.
    pub fn to_json(&self) -> Result<Value> {
        #[derive(Serialize)]
        struct Dump<'a> {
            name: &'a str,
            vertices: Vec<&'a Vertex>,
            edges: Vec<&'a Edge>,
        }

        let store = self.read()?;
        let dump = Dump {
            name: &self.name,
            vertices: store.vertices.values().collect(),
            edges: store.edges.values().collect(),
        };
        Ok(serde_json::to_value(dump)?)
    }
}

fn merge_into(mut existing: Vertex, incoming: Vertex) -> Vertex {
    existing.vertex_type = incoming.vertex_type;
    if incoming.sub_type.is_some() {
        existing.sub_type = incoming.sub_type;
    }
    if incoming.state.is_some() {
        existing.state = incoming.state;
    }
    if incoming.project.is_some() {
        existing.project = incoming.project;
    }
    existing.timestamp = incoming.timestamp;
    existing.is_deleted = false;
    existing.deletion_timestamp = None;

    for (key, value) in incoming.properties {
        if value.is_null() {
            existing.properties.remove(&key);
        } else {
            existing.properties.insert(key, value);
        }
    }
    existing
}
