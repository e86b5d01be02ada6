//! Error types for the topograph-consistency crate.

use thiserror::Error;

use topograph_core::TopographError;
use topograph_graph::GraphError;

#[derive(Error, Debug)]
pub enum ConsistencyError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Core(#[from] TopographError),

    #[error("Invalid event: {0}")]
    Event(String),

    #[error("Malformed event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Ingest queue closed")]
    QueueClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConsistencyError>;
