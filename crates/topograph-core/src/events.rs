//! Entity events fed into the graph by datasource collectors.
//!
//! Collectors serialize these as JSON; the ingestion loop applies them to
//! the graph in arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Edge, EdgeKey, Properties, Vertex};

/// Unique identifier for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the collector is telling the engine about the entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The entity exists with (at least) these attributes.
    Upsert,
    /// The entity is gone.
    Delete,
    /// The datasource finished delivering its initial snapshot.
    SnapshotEnd,
}

/// An edge reported together with its owning entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub neighbor_id: String,
    pub relation: String,
    /// True if the edge points from the entity to the neighbor.
    #[serde(default = "default_true")]
    pub outgoing: bool,
    #[serde(default)]
    pub properties: Properties,
}

fn default_true() -> bool {
    true
}

/// A single datasource event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityEvent {
    #[serde(default)]
    pub id: EventId,
    pub kind: EventKind,
    pub datasource_type: String,
    /// Entity identity. Empty for `SnapshotEnd`.
    #[serde(default)]
    pub identity: String,
    #[serde(default, rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl EntityEvent {
    pub fn upsert(
        datasource_type: impl Into<String>,
        identity: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self::with_kind(EventKind::Upsert, datasource_type, identity, entity_type)
    }

    pub fn delete(datasource_type: impl Into<String>, identity: impl Into<String>) -> Self {
        Self::with_kind(EventKind::Delete, datasource_type, identity, "")
    }

    pub fn snapshot_end(datasource_type: impl Into<String>) -> Self {
        Self::with_kind(EventKind::SnapshotEnd, datasource_type, "", "")
    }

    fn with_kind(
        kind: EventKind,
        datasource_type: impl Into<String>,
        identity: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            kind,
            datasource_type: datasource_type.into(),
            identity: identity.into(),
            entity_type: entity_type.into(),
            sub_type: None,
            state: None,
            project: None,
            properties: Properties::new(),
            relations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_relation(
        mut self,
        neighbor_id: impl Into<String>,
        relation: impl Into<String>,
        outgoing: bool,
    ) -> Self {
        self.relations.push(Relation {
            neighbor_id: neighbor_id.into(),
            relation: relation.into(),
            outgoing,
            properties: Properties::new(),
        });
        self
    }

    /// Build the vertex this event describes, stamped with the event time.
    pub fn to_vertex(&self) -> Vertex {
        Vertex {
            id: self.identity.clone(),
            vertex_type: self.entity_type.clone(),
            sub_type: self.sub_type.clone(),
            state: self.state.clone(),
            project: self.project.clone(),
            timestamp: self.timestamp,
            is_deleted: false,
            deletion_timestamp: None,
            properties: self.properties.clone(),
        }
    }

    /// Build the edges listed in `relations`.
    pub fn to_edges(&self) -> Vec<Edge> {
        self.relations
            .iter()
            .map(|r| {
                let key = if r.outgoing {
                    EdgeKey::new(&self.identity, &r.neighbor_id, &r.relation)
                } else {
                    EdgeKey::new(&r.neighbor_id, &self.identity, &r.relation)
                };
                Edge {
                    key,
                    timestamp: self.timestamp,
                    is_deleted: false,
                    deletion_timestamp: None,
                    properties: r.properties.clone(),
                }
            })
            .collect()
    }
}
