//! Error types for the topograph-graph crate.

use thiserror::Error;

use topograph_core::{EdgeKey, ItemId};

/// Errors from graph operations.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Not found: {0}")]
    NotFound(ItemId),

    #[error("Already exists: {0}")]
    Conflict(ItemId),

    #[error("Edge {edge} references missing vertex {missing}")]
    DanglingReference { edge: EdgeKey, missing: String },

    #[error("Mutation of {0} attempted to change its identity")]
    InvalidMutation(ItemId),

    #[error("Timed out after {timeout_ms}ms waiting for the graph lock")]
    LockTimeout { timeout_ms: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GraphError {
    pub(crate) fn vertex_not_found(id: &str) -> Self {
        GraphError::NotFound(ItemId::Vertex { id: id.to_string() })
    }

    pub(crate) fn edge_not_found(key: &EdgeKey) -> Self {
        GraphError::NotFound(ItemId::Edge { key: key.clone() })
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
