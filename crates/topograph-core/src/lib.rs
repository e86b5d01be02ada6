//! topograph-core: Shared types, configuration, and error handling for Topograph.
//!
//! This crate provides the foundational vocabulary used across all Topograph components:
//! - Vertex and edge types for the topology graph, with their tombstone markers
//! - Entity events delivered by datasource collectors
//! - Configuration loading
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use error::TopographError;
pub use events::{EntityEvent, EventId, EventKind, Relation};
pub use types::{fields, Edge, EdgeKey, Item, ItemId, Properties, Vertex};
