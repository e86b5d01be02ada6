//! Per-datasource consistency state.
//!
//! Tracks, for every datasource type, whether it has finished delivering its
//! initial snapshot and when it last sent anything. The enforcer only starts
//! sweeping once every registered datasource has reported snapshot-end.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// What we know about one datasource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasourceStatus {
    pub has_reported_end: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    registered: BTreeSet<String>,
    statuses: BTreeMap<String, DatasourceStatus>,
}

/// Process-wide datasource registry, shared between ingestion and the
/// enforcer.
#[derive(Debug, Default)]
pub struct DatasourceState {
    inner: RwLock<Inner>,
}

impl DatasourceState {
    pub fn new<I, S>(registered: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = Self::default();
        for name in registered {
            state.register(name);
        }
        state
    }

    /// Require `name` to report snapshot-end before initialization completes.
    pub fn register(&self, name: impl Into<String>) {
        let name = name.into();
        let mut inner = self.inner.write();
        inner.statuses.entry(name.clone()).or_default();
        inner.registered.insert(name);
    }

    pub fn registered(&self) -> Vec<String> {
        self.inner.read().registered.iter().cloned().collect()
    }

    /// Note an event from `datasource` at `at`. Unknown datasources get a
    /// status entry but are not registered.
    pub fn record_event(&self, datasource: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        let status = inner.statuses.entry(datasource.to_string()).or_default();
        touch(status, at);
    }

    pub fn mark_snapshot_end(&self, datasource: &str, at: DateTime<Utc>) {
        let mut inner = self.inner.write();
        let status = inner.statuses.entry(datasource.to_string()).or_default();
        touch(status, at);
        if !status.has_reported_end {
            status.has_reported_end = true;
            tracing::info!(datasource, "Datasource reported snapshot end");
        }
    }

    /// True when every registered datasource has reported snapshot-end.
    /// Vacuously true with nothing registered.
    pub fn all_reported(&self) -> bool {
        let inner = self.inner.read();
        inner.registered.iter().all(|name| {
            inner
                .statuses
                .get(name)
                .is_some_and(|status| status.has_reported_end)
        })
    }

    /// Registered datasources still owing a snapshot-end.
    pub fn pending(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .registered
            .iter()
            .filter(|name| {
                !inner
                    .statuses
                    .get(*name)
                    .is_some_and(|status| status.has_reported_end)
            })
            .cloned()
            .collect()
    }

    pub fn status(&self, datasource: &str) -> Option<DatasourceStatus> {
        self.inner.read().statuses.get(datasource).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, DatasourceStatus> {
        self.inner.read().statuses.clone()
    }

    /// Forget everything, registrations included.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.registered.clear();
        inner.statuses.clear();
    }
}

// Out-of-order events never move last_seen backwards.
fn touch(status: &mut DatasourceStatus, at: DateTime<Utc>) {
    if status.last_seen.map_or(true, |seen| at > seen) {
        status.last_seen = Some(at);
    }
}
