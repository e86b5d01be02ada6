//! Consistency enforcement.
//!
//! Datasources that stop reporting an entity never send a delete for it.
//! The enforcer catches those: once every registered datasource has
//! delivered its initial snapshot, it periodically tombstones every item
//! whose `TIMESTAMP` is at least the deletion window old.
//!
//! Sweeps take the graph's blocking locks, so [`ConsistencyEnforcer::run`]
//! hands each one to tokio's blocking pool.
//!
//! Until initialization completes nothing is tombstoned, so entities from a
//! datasource that is still catching up are not deleted by mistake.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use topograph_graph::{CompactionSummary, GraphError, PropertyGraph};

use crate::config::ConsistencyConfig;
use crate::error::{ConsistencyError, Result};
use crate::state::DatasourceState;

/// Enforcer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Waiting for datasources to report snapshot-end.
    Initializing,
    /// Sweeping on every tick.
    Active,
}

/// How initialization ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Every registered datasource reported, after this many checks.
    Complete { attempts: u32 },
    /// Retries ran out; sweeping starts anyway.
    Degraded { attempts: u32 },
    /// Shutdown arrived first.
    Cancelled,
}

/// Counters from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub vertices_deleted: usize,
    pub edges_deleted: usize,
    /// Items that could not be tombstoned; they are retried next tick.
    pub failures: usize,
    pub compacted: Option<CompactionSummary>,
}

/// Periodic soft-delete of items no datasource refreshes any more.
pub struct ConsistencyEnforcer {
    graph: Arc<PropertyGraph>,
    state: Arc<DatasourceState>,
    config: ConsistencyConfig,
    phase: Phase,
}

impl ConsistencyEnforcer {
    pub fn new(
        graph: Arc<PropertyGraph>,
        state: Arc<DatasourceState>,
        config: ConsistencyConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            graph,
            state,
            config,
            phase: Phase::Initializing,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Wait for every registered datasource to report snapshot-end.
    ///
    /// Checks up to `initialization_max_retries` times, sleeping
    /// `initialization_interval` between checks. Always leaves the enforcer
    /// Active unless cancelled.
    pub async fn initialize(&mut self, shutdown: &mut watch::Receiver<bool>) -> InitOutcome {
        let max = self.config.initialization_max_retries;
        if self.state.registered().is_empty() {
            tracing::warn!("No datasources registered, consistency sweeps start immediately");
        }

        for attempt in 1..=max {
            if *shutdown.borrow() {
                return InitOutcome::Cancelled;
            }
            if self.state.all_reported() {
                self.phase = Phase::Active;
                tracing::info!(attempts = attempt, "Consistency initialization complete");
                return InitOutcome::Complete { attempts: attempt };
            }
            tracing::debug!(
                attempt,
                max,
                pending = ?self.state.pending(),
                "Waiting for datasource snapshots"
            );
            if attempt == max {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => return InitOutcome::Cancelled,
                _ = tokio::time::sleep(self.config.initialization_interval()) => {}
            }
        }

        tracing::warn!(
            attempts = max,
            pending = ?self.state.pending(),
            "Datasources did not all report snapshot end, starting degraded"
        );
        self.phase = Phase::Active;
        InitOutcome::Degraded { attempts: max }
    }

    /// Tombstone everything last refreshed at or before `now - min_time_to_delete`,
    /// then compact old tombstones if a retention is configured.
    ///
    /// Does nothing while Initializing. Per-item failures are counted and
    /// logged; only a failure to read the graph fails the sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        if self.phase != Phase::Active {
            tracing::debug!("Sweep skipped, initialization not complete");
            return Ok(summary);
        }

        let cutoff = window_start(now, self.config.min_time_to_delete())?;

        for id in self.graph.stale_vertices(cutoff)? {
            match self.graph.delete_vertex_if_stale(&id, cutoff) {
                Ok(Some(_)) => summary.vertices_deleted += 1,
                Ok(None) => {}
                // Compacted between listing and deletion.
                Err(GraphError::NotFound(_)) => {}
                Err(e) => {
                    summary.failures += 1;
                    tracing::warn!(vertex = %id, error = %e, "Failed to tombstone stale vertex");
                }
            }
        }

        for key in self.graph.stale_edges(cutoff)? {
            match self.graph.delete_edge_if_stale(&key, cutoff) {
                Ok(Some(_)) => summary.edges_deleted += 1,
                Ok(None) | Err(GraphError::NotFound(_)) => {}
                Err(e) => {
                    summary.failures += 1;
                    tracing::warn!(edge = %key, error = %e, "Failed to tombstone stale edge");
                }
            }
        }

        if let Some(retention) = self.config.tombstone_retention() {
            summary.compacted = Some(self.graph.compact(window_start(now, retention)?)?);
        }

        tracing::info!(
            vertices_deleted = summary.vertices_deleted,
            edges_deleted = summary.edges_deleted,
            failures = summary.failures,
            "Consistency sweep complete"
        );
        Ok(summary)
    }

    /// Initialize, then sweep every `consistency_interval` until shutdown.
    /// A sweep in progress when shutdown arrives runs to completion.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if self.initialize(&mut shutdown).await == InitOutcome::Cancelled {
            tracing::info!("Consistency enforcer cancelled during initialization");
            return;
        }
        let enforcer = Arc::new(self);

        let mut ticker = interval(enforcer.config.consistency_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = enforcer.config.consistency_interval,
            min_time_to_delete = enforcer.config.min_time_to_delete,
            "Consistency enforcer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let sweeper = enforcer.clone();
                    match tokio::task::spawn_blocking(move || sweeper.sweep(Utc::now())).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::error!(error = %e, "Consistency sweep failed"),
                        Err(e) => tracing::error!(error = %e, "Consistency sweep task panicked"),
                    }
                }
            }
        }

        tracing::info!("Consistency enforcer stopped");
    }
}

fn window_start(now: DateTime<Utc>, window: chrono::TimeDelta) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(window).ok_or_else(|| {
        ConsistencyError::Configuration(format!(
            "window of {}s reaches before the earliest timestamp",
            window.num_seconds()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeDelta;
    use parking_lot::Mutex;
    use topograph_core::{Edge, EdgeKey, Vertex};

    fn config() -> ConsistencyConfig {
        ConsistencyConfig {
            initialization_max_retries: 1,
            ..Default::default()
        }
    }

    fn enforcer_with(
        datasources: &[&str],
        config: ConsistencyConfig,
    ) -> (ConsistencyEnforcer, Arc<PropertyGraph>, Arc<DatasourceState>) {
        let graph = Arc::new(PropertyGraph::new("test"));
        let state = Arc::new(DatasourceState::new(datasources.iter().copied()));
        let enforcer = ConsistencyEnforcer::new(graph.clone(), state.clone(), config).unwrap();
        (enforcer, graph, state)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let graph = Arc::new(PropertyGraph::new("test"));
        let state = Arc::new(DatasourceState::default());
        let config = ConsistencyConfig {
            min_time_to_delete: 10,
            ..Default::default()
        };
        assert!(ConsistencyEnforcer::new(graph, state, config).is_err());
    }

    #[tokio::test]
    async fn test_nothing_tombstoned_before_initialization() {
        let (enforcer, graph, _) = enforcer_with(&["nova"], config());
        let t0 = Utc::now();
        graph
            .add_vertex(Vertex::new("h1", "nova.host").with_timestamp(t0))
            .unwrap();

        assert_eq!(enforcer.phase(), Phase::Initializing);
        let summary = enforcer.sweep(t0 + TimeDelta::seconds(3600)).unwrap();
        assert_eq!(summary, SweepSummary::default());
        assert!(!graph.get_vertex("h1").unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_sweep_honours_deletion_window() {
        let (mut enforcer, graph, state) = enforcer_with(&["nova"], config());
        let t0 = Utc::now();
        graph
            .add_vertex(Vertex::new("h1", "nova.host").with_timestamp(t0))
            .unwrap();
        graph
            .add_vertex(Vertex::new("i1", "nova.instance").with_timestamp(t0))
            .unwrap();
        graph
            .add_edge(Edge::new("h1", "i1", "contains").with_timestamp(t0))
            .unwrap();

        state.mark_snapshot_end("nova", t0);
        let (_tx, mut rx) = watch::channel(false);
        assert_eq!(
            enforcer.initialize(&mut rx).await,
            InitOutcome::Complete { attempts: 1 }
        );

        let early = enforcer.sweep(t0 + TimeDelta::seconds(30)).unwrap();
        assert_eq!(early.vertices_deleted, 0);
        assert!(!graph.get_vertex("h1").unwrap().unwrap().is_deleted);

        let late = enforcer.sweep(t0 + TimeDelta::seconds(61)).unwrap();
        assert_eq!(late.vertices_deleted, 2);
        assert_eq!(late.edges_deleted, 1);
        assert!(graph.get_vertex("h1").unwrap().unwrap().is_deleted);
        assert!(graph
            .get_edge(&EdgeKey::new("h1", "i1", "contains"))
            .unwrap()
            .unwrap()
            .is_deleted);

        // Already tombstoned items are not counted again.
        let again = enforcer.sweep(t0 + TimeDelta::seconds(120)).unwrap();
        assert_eq!(again.vertices_deleted, 0);
    }

    #[tokio::test]
    async fn test_sweep_at_exact_window_deletes() {
        let (mut enforcer, graph, _) = enforcer_with(&[], config());
        let t0 = Utc::now();
        graph
            .add_vertex(Vertex::new("h1", "nova.host").with_timestamp(t0))
            .unwrap();

        let (_tx, mut rx) = watch::channel(false);
        enforcer.initialize(&mut rx).await;

        let just_before = enforcer
            .sweep(t0 + TimeDelta::seconds(60) - TimeDelta::milliseconds(1))
            .unwrap();
        assert_eq!(just_before.vertices_deleted, 0);

        let summary = enforcer.sweep(t0 + TimeDelta::seconds(60)).unwrap();
        assert_eq!(summary.vertices_deleted, 1);
        assert!(graph.get_vertex("h1").unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_sweep_near_earliest_timestamp_fails_cleanly() {
        let (mut enforcer, _, _) = enforcer_with(&[], config());
        let (_tx, mut rx) = watch::channel(false);
        enforcer.initialize(&mut rx).await;

        assert!(matches!(
            enforcer.sweep(DateTime::<Utc>::MIN_UTC),
            Err(ConsistencyError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_fresh_items_survive_sweep() {
        let (mut enforcer, graph, _) = enforcer_with(&[], config());
        let t0 = Utc::now();
        graph
            .add_vertex(Vertex::new("old", "nova.host").with_timestamp(t0 - TimeDelta::seconds(61)))
            .unwrap();
        graph
            .add_vertex(Vertex::new("fresh", "nova.host").with_timestamp(t0 - TimeDelta::seconds(30)))
            .unwrap();

        let (_tx, mut rx) = watch::channel(false);
        enforcer.initialize(&mut rx).await;
        enforcer.sweep(t0).unwrap();

        assert!(graph.get_vertex("old").unwrap().unwrap().is_deleted);
        assert!(!graph.get_vertex("fresh").unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn test_subscribers_observe_sweep_deletions() {
        let (mut enforcer, graph, _) = enforcer_with(&[], config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        graph.subscribe(move |prev, curr| {
            sink.lock().push((prev.map(|p| p.is_deleted()), curr.is_deleted()));
            Ok(())
        });
        let t0 = Utc::now();
        graph
            .add_vertex(Vertex::new("h1", "nova.host").with_timestamp(t0))
            .unwrap();

        let (_tx, mut rx) = watch::channel(false);
        enforcer.initialize(&mut rx).await;
        enforcer.sweep(t0 + TimeDelta::seconds(61)).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], (Some(false), true));
    }

    #[tokio::test]
    async fn test_degraded_start_after_retries() {
        let (mut enforcer, graph, _) = enforcer_with(&["nova", "neutron"], config());
        let t0 = Utc::now();
        graph
            .add_vertex(Vertex::new("h1", "nova.host").with_timestamp(t0))
            .unwrap();

        let (_tx, mut rx) = watch::channel(false);
        assert_eq!(
            enforcer.initialize(&mut rx).await,
            InitOutcome::Degraded { attempts: 1 }
        );
        assert_eq!(enforcer.phase(), Phase::Active);

        let summary = enforcer.sweep(t0 + TimeDelta::seconds(61)).unwrap();
        assert_eq!(summary.vertices_deleted, 1);
    }

    #[tokio::test]
    async fn test_initialize_retries_until_reported() {
        let config = ConsistencyConfig {
            initialization_max_retries: 5,
            ..Default::default()
        };
        let (mut enforcer, _, state) = enforcer_with(&["nova"], config);

        let reporter = {
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                state.mark_snapshot_end("nova", Utc::now());
            })
        };

        let (_tx, mut rx) = watch::channel(false);
        let outcome = enforcer.initialize(&mut rx).await;
        reporter.await.unwrap();

        assert_eq!(outcome, InitOutcome::Complete { attempts: 2 });
    }

    #[tokio::test]
    async fn test_compaction_with_retention() {
        let config = ConsistencyConfig {
            initialization_max_retries: 1,
            tombstone_retention: Some(60),
            ..Default::default()
        };
        let (mut enforcer, graph, _) = enforcer_with(&[], config);
        graph.add_vertex(Vertex::new("gone", "nova.host")).unwrap();
        graph.delete_vertex("gone").unwrap();

        let (_tx, mut rx) = watch::channel(false);
        enforcer.initialize(&mut rx).await;

        let now = Utc::now();
        let summary = enforcer.sweep(now).unwrap();
        assert_eq!(summary.compacted, Some(CompactionSummary::default()));
        assert_eq!(graph.vertex_count().unwrap(), 1);

        let later = enforcer.sweep(now + TimeDelta::seconds(61)).unwrap();
        assert_eq!(later.compacted.unwrap().vertices_removed, 1);
        assert_eq!(graph.vertex_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = ConsistencyConfig {
            initialization_max_retries: 60,
            ..Default::default()
        };
        let (enforcer, _, _) = enforcer_with(&["never"], config);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(enforcer.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("enforcer did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_sweeps_stale_items() {
        let (enforcer, graph, _) = enforcer_with(&[], config());
        graph
            .add_vertex(
                Vertex::new("h1", "nova.host").with_timestamp(Utc::now() - TimeDelta::seconds(120)),
            )
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(enforcer.run(rx));

        // The first tick fires immediately.
        let deleted = async {
            while !graph.get_vertex("h1").unwrap().unwrap().is_deleted {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), deleted)
            .await
            .expect("stale vertex was not swept");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("enforcer did not stop")
            .unwrap();
    }
}
