//! Entity schema for the topology graph.
//!
//! Vertices and edges carry a small set of typed fields that every component
//! relies on (identity, type, state, timestamps, tombstone markers) plus a
//! free-form property map for whatever a datasource reports.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Field vocabulary ──────────────────────────────────────────────

/// Stable, case-sensitive attribute keys shared by every component.
pub mod fields {
    pub const TYPE: &str = "TYPE";
    pub const SUB_TYPE: &str = "SUB_TYPE";
    pub const ID: &str = "ID";
    pub const VERTEX_ID: &str = "VERTEX_ID";
    pub const EVENT_TYPE: &str = "EVENT_TYPE";
    pub const IS_VERTEX_DELETED: &str = "IS_VERTEX_DELETED";
    pub const VERTEX_DELETION_TIMESTAMP: &str = "VERTEX_DELETION_TIMESTAMP";
    pub const STATE: &str = "STATE";
    pub const PROJECT: &str = "PROJECT";
    pub const TIMESTAMP: &str = "TIMESTAMP";

    pub const RELATION_NAME: &str = "RELATION_NAME";
    pub const IS_EDGE_DELETED: &str = "IS_EDGE_DELETED";
    pub const EDGE_DELETION_TIMESTAMP: &str = "EDGE_DELETION_TIMESTAMP";
}

/// Free-form attributes. Values are JSON scalars in practice.
pub type Properties = BTreeMap<String, Value>;

// ── Vertex ────────────────────────────────────────────────────────

/// A node in the topology graph (host, instance, zone, alarm, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    /// Opaque identity, unique within a graph.
    pub id: String,
    pub vertex_type: String,
    pub sub_type: Option<String>,
    pub state: Option<String>,
    pub project: Option<String>,
    /// Last update, also used as the entity's last-seen time.
    pub timestamp: DateTime<Utc>,
    pub is_deleted: bool,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: Properties,
}

impl Vertex {
    pub fn new(id: impl Into<String>, vertex_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vertex_type: vertex_type.into(),
            sub_type: None,
            state: None,
            project: None,
            timestamp: Utc::now(),
            is_deleted: false,
            deletion_timestamp: None,
            properties: Properties::new(),
        }
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Resolve an attribute by key.
    ///
    /// Schema keys map onto the typed fields; anything else is looked up in
    /// the free-form properties. Missing optional fields resolve to `None`.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            fields::ID | fields::VERTEX_ID => Some(Value::String(self.id.clone())),
            fields::TYPE => Some(Value::String(self.vertex_type.clone())),
            fields::SUB_TYPE => self.sub_type.clone().map(Value::String),
            fields::STATE => self.state.clone().map(Value::String),
            fields::PROJECT => self.project.clone().map(Value::String),
            fields::TIMESTAMP => Some(Value::String(self.timestamp.to_rfc3339())),
            fields::IS_VERTEX_DELETED => Some(Value::Bool(self.is_deleted)),
            fields::VERTEX_DELETION_TIMESTAMP => self
                .deletion_timestamp
                .map(|ts| Value::String(ts.to_rfc3339())),
            other => self.properties.get(other).cloned(),
        }
    }

    /// Latest of the update and deletion times.
    pub fn last_changed(&self) -> DateTime<Utc> {
        self.deletion_timestamp
            .map_or(self.timestamp, |deleted| deleted.max(self.timestamp))
    }

    /// Set the tombstone pair. Returns false if the vertex was already
    /// tombstoned, in which case nothing changes.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_deleted {
            return false;
        }
        self.is_deleted = true;
        self.deletion_timestamp = Some(now);
        true
    }
}

// ── Edge ──────────────────────────────────────────────────────────

/// Composite edge identity. Several relations may connect the same pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
}

impl EdgeKey {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relation: relation.into(),
        }
    }

    /// The endpoint opposite `vertex_id`, if `vertex_id` is an endpoint.
    pub fn other_end(&self, vertex_id: &str) -> Option<&str> {
        if self.source_id == vertex_id {
            Some(&self.target_id)
        } else if self.target_id == vertex_id {
            Some(&self.source_id)
        } else {
            None
        }
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-[{}]->{}",
            self.source_id, self.relation, self.target_id
        )
    }
}

/// A directed, labelled relation between two vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub key: EdgeKey,
    pub timestamp: DateTime<Utc>,
    pub is_deleted: bool,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: Properties,
}

impl Edge {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            key: EdgeKey::new(source_id, target_id, relation),
            timestamp: Utc::now(),
            is_deleted: false,
            deletion_timestamp: None,
            properties: Properties::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn source_id(&self) -> &str {
        &self.key.source_id
    }

    pub fn target_id(&self) -> &str {
        &self.key.target_id
    }

    pub fn relation(&self) -> &str {
        &self.key.relation
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            fields::RELATION_NAME => Some(Value::String(self.key.relation.clone())),
            fields::TIMESTAMP => Some(Value::String(self.timestamp.to_rfc3339())),
            fields::IS_EDGE_DELETED => Some(Value::Bool(self.is_deleted)),
            fields::EDGE_DELETION_TIMESTAMP => self
                .deletion_timestamp
                .map(|ts| Value::String(ts.to_rfc3339())),
            other => self.properties.get(other).cloned(),
        }
    }

    /// See [`Vertex::last_changed`].
    pub fn last_changed(&self) -> DateTime<Utc> {
        self.deletion_timestamp
            .map_or(self.timestamp, |deleted| deleted.max(self.timestamp))
    }

    /// See [`Vertex::mark_deleted`].
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_deleted {
            return false;
        }
        self.is_deleted = true;
        self.deletion_timestamp = Some(now);
        true
    }
}

// ── Items ─────────────────────────────────────────────────────────

/// Identity of any graph item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum ItemId {
    Vertex { id: String },
    Edge { key: EdgeKey },
}

impl From<EdgeKey> for ItemId {
    fn from(key: EdgeKey) -> Self {
        ItemId::Edge { key }
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Vertex { id } => write!(f, "vertex {id}"),
            ItemId::Edge { key } => write!(f, "edge {key}"),
        }
    }
}

/// An owned copy of a vertex or an edge, as handed to callers and
/// notification subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum Item {
    Vertex(Vertex),
    Edge(Edge),
}

impl From<Vertex> for Item {
    fn from(vertex: Vertex) -> Self {
        Item::Vertex(vertex)
    }
}

impl From<Edge> for Item {
    fn from(edge: Edge) -> Self {
        Item::Edge(edge)
    }
}

impl Item {
    pub fn id(&self) -> ItemId {
        match self {
            Item::Vertex(v) => ItemId::Vertex { id: v.id.clone() },
            Item::Edge(e) => ItemId::Edge { key: e.key.clone() },
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Item::Vertex(v) => v.is_deleted,
            Item::Edge(e) => e.is_deleted,
        }
    }

    pub fn as_vertex(&self) -> Option<&Vertex> {
        match self {
            Item::Vertex(v) => Some(v),
            Item::Edge(_) => None,
        }
    }

    pub fn as_edge(&self) -> Option<&Edge> {
        match self {
            Item::Edge(e) => Some(e),
            Item::Vertex(_) => None,
        }
    }
}
