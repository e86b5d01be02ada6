//! Topograph Graph — the in-memory entity graph engine.
//!
//! This crate owns the topology graph: guarded mutation with tombstone
//! deletion, change notification, and filtered breadth-first subgraph
//! queries. All reads and writes go through [`PropertyGraph`] so that
//! locking and notification stay consistent.

pub mod error;
pub mod graph;
pub mod matcher;
pub mod notifier;
pub mod query;

pub use error::{GraphError, Result};
pub use graph::{CompactionSummary, GraphConfig, PropertyGraph};
pub use matcher::{Matcher, QueryMatcher};
pub use notifier::Notifier;
pub use query::{BfsAlgorithm, GraphAlgorithm};
