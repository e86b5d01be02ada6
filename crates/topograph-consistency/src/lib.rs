//! topograph-consistency: keeps the entity graph in step with its datasources.
//!
//! Applies datasource events to the graph through a bounded ingest queue and
//! runs the consistency enforcer that soft-deletes entities nobody reports
//! any more.

pub mod config;
pub mod enforcer;
pub mod error;
pub mod ingest;
pub mod state;

pub use config::{Backpressure, ConsistencyConfig};
pub use enforcer::{ConsistencyEnforcer, InitOutcome, Phase, SweepSummary};
pub use error::{ConsistencyError, Result};
pub use ingest::{EventSender, IngestSummary, Ingestor, ReadSummary, SendOutcome};
pub use state::{DatasourceState, DatasourceStatus};
