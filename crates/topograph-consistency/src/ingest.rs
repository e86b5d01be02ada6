//! Event ingestion.
//!
//! Producers push [`EntityEvent`]s into a bounded queue; a single consumer
//! applies them to the graph in arrival order. When the queue is full the
//! producer either waits or drops the event, per [`Backpressure`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};

use topograph_core::{EntityEvent, EventKind};
use topograph_graph::PropertyGraph;

use crate::config::Backpressure;
use crate::error::{ConsistencyError, Result};
use crate::state::DatasourceState;

/// Create the ingest queue.
pub fn channel(
    capacity: usize,
    backpressure: Backpressure,
) -> (EventSender, mpsc::Receiver<EntityEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = EventSender {
        tx,
        backpressure,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

/// Result of a single [`EventSender::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Queue was full under [`Backpressure::DropNewest`].
    Dropped,
}

/// Producer handle for the ingest queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EntityEvent>,
    backpressure: Backpressure,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    pub async fn send(&self, event: EntityEvent) -> Result<SendOutcome> {
        match self.backpressure {
            Backpressure::Block => {
                self.tx
                    .send(event)
                    .await
                    .map_err(|_| ConsistencyError::QueueClosed)?;
                Ok(SendOutcome::Queued)
            }
            Backpressure::DropNewest => match self.tx.try_send(event) {
                Ok(()) => Ok(SendOutcome::Queued),
                Err(mpsc::error::TrySendError::Full(event)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        event_id = %event.id.0,
                        datasource = %event.datasource_type,
                        dropped_total = total,
                        "Ingest queue full, dropping event"
                    );
                    Ok(SendOutcome::Dropped)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(ConsistencyError::QueueClosed),
            },
        }
    }

    /// Events discarded so far by this sender and its clones.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Counters from a [`read_json_lines`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadSummary {
    pub queued: u64,
    pub dropped: u64,
    pub malformed: u64,
}

/// Parse newline-delimited JSON events from `reader` into the queue until
/// EOF or shutdown. Blank lines are skipped; malformed ones are logged.
pub async fn read_json_lines<R>(
    reader: R,
    sender: EventSender,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ReadSummary>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut summary = ReadSummary::default();
    let mut line_no = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }
        let line = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!(lines = line_no, "Event stream closed");
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event = match decode_event(&line) {
            Ok(event) => event,
            Err(e) => {
                summary.malformed += 1;
                tracing::warn!(line = line_no, error = %e, "Skipping malformed event");
                continue;
            }
        };
        match sender.send(event).await? {
            SendOutcome::Queued => summary.queued += 1,
            SendOutcome::Dropped => summary.dropped += 1,
        }
    }

    Ok(summary)
}

/// Parse one NDJSON line into an event.
pub fn decode_event(line: &str) -> Result<EntityEvent> {
    Ok(serde_json::from_str(line)?)
}

/// Counters from an [`Ingestor::run`] loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub applied: u64,
    pub failed: u64,
}

/// Applies entity events to the graph and the datasource state.
#[derive(Debug, Clone)]
pub struct Ingestor {
    graph: Arc<PropertyGraph>,
    state: Arc<DatasourceState>,
}

impl Ingestor {
    pub fn new(graph: Arc<PropertyGraph>, state: Arc<DatasourceState>) -> Self {
        Self { graph, state }
    }

    /// Apply one event.
    ///
    /// An upsert merges into the existing vertex and then upserts every
    /// listed relation. Each relation is attempted even if an earlier one
    /// fails; the first failure is returned.
    ///
    /// Events older than the stored entity's last change are ignored, so a
    /// delayed event never rolls state or `TIMESTAMP` back.
    pub fn apply(&self, event: &EntityEvent) -> Result<()> {
        if event.datasource_type.is_empty() {
            return Err(invalid_event(event, "missing datasource_type"));
        }

        match event.kind {
            EventKind::Upsert => {
                if event.identity.is_empty() || event.entity_type.is_empty() {
                    return Err(invalid_event(event, "upsert needs identity and type"));
                }
                self.state
                    .record_event(&event.datasource_type, event.timestamp);
                let stored = self.graph.merge_vertex(event.to_vertex())?;
                if stored.last_changed() > event.timestamp {
                    tracing::debug!(
                        event_id = %event.id.0,
                        identity = %event.identity,
                        "Upsert older than stored entity, ignored"
                    );
                    return Ok(());
                }

                let mut first_error = None;
                for edge in event.to_edges() {
                    let key = edge.key.clone();
                    if let Err(e) = self.graph.merge_edge(edge) {
                        tracing::warn!(
                            event_id = %event.id.0,
                            edge = %key,
                            error = %e,
                            "Relation rejected"
                        );
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    Some(e) => Err(e.into()),
                    None => Ok(()),
                }
            }
            EventKind::Delete => {
                if event.identity.is_empty() {
                    return Err(invalid_event(event, "delete needs identity"));
                }
                self.state
                    .record_event(&event.datasource_type, event.timestamp);
                let deleted = self
                    .graph
                    .delete_vertex_as_of(&event.identity, event.timestamp)?;
                if deleted.is_none() {
                    tracing::debug!(
                        event_id = %event.id.0,
                        identity = %event.identity,
                        "Delete older than stored entity or already applied"
                    );
                }
                Ok(())
            }
            EventKind::SnapshotEnd => {
                self.state
                    .mark_snapshot_end(&event.datasource_type, event.timestamp);
                Ok(())
            }
        }
    }

    /// Consume the queue until it closes or shutdown is signalled. Events
    /// already queued at shutdown are still applied.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<EntityEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> IngestSummary {
        let mut summary = IngestSummary::default();
        tracing::info!("Ingestion started");

        while !*shutdown.borrow() {
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => event,
            };
            match event {
                Some(event) => self.apply_logged(&event, &mut summary),
                None => break,
            }
        }

        events.close();
        while let Ok(event) = events.try_recv() {
            self.apply_logged(&event, &mut summary);
        }

        tracing::info!(
            applied = summary.applied,
            failed = summary.failed,
            "Ingestion stopped"
        );
        summary
    }

    fn apply_logged(&self, event: &EntityEvent, summary: &mut IngestSummary) {
        match self.apply(event) {
            Ok(()) => summary.applied += 1,
            Err(e) => {
                summary.failed += 1;
                tracing::error!(
                    event_id = %event.id.0,
                    kind = ?event.kind,
                    identity = %event.identity,
                    error = %e,
                    "Failed to apply event"
                );
            }
        }
    }
}

fn invalid_event(event: &EntityEvent, reason: &str) -> ConsistencyError {
    ConsistencyError::Event(format!(
        "{} from '{}': {reason}",
        event.id.0, event.datasource_type
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use topograph_core::EdgeKey;
    use topograph_graph::GraphError;

    fn ingestor() -> (Ingestor, Arc<PropertyGraph>, Arc<DatasourceState>) {
        let graph = Arc::new(PropertyGraph::new("test"));
        let state = Arc::new(DatasourceState::new(["nova"]));
        (Ingestor::new(graph.clone(), state.clone()), graph, state)
    }

    #[test]
    fn test_upsert_creates_vertex_and_relations() {
        let (ingestor, graph, state) = ingestor();
        ingestor
            .apply(&EntityEvent::upsert("nova", "zone-1", "nova.zone"))
            .unwrap();
        ingestor
            .apply(
                &EntityEvent::upsert("nova", "host-1", "nova.host")
                    .with_state("AVAILABLE")
                    .with_relation("zone-1", "contains", false),
            )
            .unwrap();

        let host = graph.get_vertex("host-1").unwrap().unwrap();
        assert_eq!(host.state.as_deref(), Some("AVAILABLE"));
        assert!(graph
            .get_edge(&EdgeKey::new("zone-1", "host-1", "contains"))
            .unwrap()
            .is_some());
        assert!(state.status("nova").unwrap().last_seen.is_some());
    }

    #[test]
    fn test_upsert_merges_properties() {
        let (ingestor, graph, _) = ingestor();
        ingestor
            .apply(
                &EntityEvent::upsert("nova", "i-1", "nova.instance")
                    .with_property("flavor", "small"),
            )
            .unwrap();
        ingestor
            .apply(
                &EntityEvent::upsert("nova", "i-1", "nova.instance").with_property("host", "h1"),
            )
            .unwrap();

        let vertex = graph.get_vertex("i-1").unwrap().unwrap();
        assert_eq!(vertex.properties.len(), 2);
    }

    #[test]
    fn test_dangling_relation_is_reported_but_vertex_kept() {
        let (ingestor, graph, _) = ingestor();
        let result = ingestor.apply(
            &EntityEvent::upsert("nova", "host-1", "nova.host")
                .with_relation("nowhere", "contains", true),
        );

        assert!(matches!(
            result,
            Err(ConsistencyError::Graph(GraphError::DanglingReference { .. }))
        ));
        assert!(graph.get_vertex("host-1").unwrap().is_some());
        assert_eq!(graph.edge_count().unwrap(), 0);
    }

    #[test]
    fn test_delete_and_snapshot_end() {
        let (ingestor, graph, state) = ingestor();
        ingestor
            .apply(&EntityEvent::upsert("nova", "host-1", "nova.host"))
            .unwrap();
        ingestor
            .apply(&EntityEvent::delete("nova", "host-1"))
            .unwrap();
        assert!(graph.get_vertex("host-1").unwrap().unwrap().is_deleted);

        assert!(!state.all_reported());
        ingestor.apply(&EntityEvent::snapshot_end("nova")).unwrap();
        assert!(state.all_reported());
    }

    #[test]
    fn test_late_upsert_does_not_roll_back() {
        let (ingestor, graph, _) = ingestor();
        let now = Utc::now();
        ingestor
            .apply(
                &EntityEvent::upsert("nova", "i-1", "nova.instance")
                    .with_state("ACTIVE")
                    .with_timestamp(now),
            )
            .unwrap();
        ingestor
            .apply(
                &EntityEvent::upsert("nova", "i-1", "nova.instance")
                    .with_state("BUILDING")
                    .with_timestamp(now - TimeDelta::seconds(120)),
            )
            .unwrap();

        let vertex = graph.get_vertex("i-1").unwrap().unwrap();
        assert_eq!(vertex.state.as_deref(), Some("ACTIVE"));
        assert_eq!(vertex.timestamp, now);
    }

    #[test]
    fn test_late_delete_is_ignored() {
        let (ingestor, graph, _) = ingestor();
        let now = Utc::now();
        ingestor
            .apply(&EntityEvent::upsert("nova", "i-1", "nova.instance").with_timestamp(now))
            .unwrap();
        ingestor
            .apply(&EntityEvent::delete("nova", "i-1").with_timestamp(now - TimeDelta::seconds(5)))
            .unwrap();
        assert!(!graph.get_vertex("i-1").unwrap().unwrap().is_deleted);

        ingestor
            .apply(&EntityEvent::delete("nova", "i-1").with_timestamp(now + TimeDelta::seconds(5)))
            .unwrap();
        assert!(graph.get_vertex("i-1").unwrap().unwrap().is_deleted);
    }

    #[test]
    fn test_late_relation_keeps_edge_timestamp() {
        let (ingestor, graph, _) = ingestor();
        let now = Utc::now();
        ingestor
            .apply(&EntityEvent::upsert("nova", "h1", "nova.host").with_timestamp(now))
            .unwrap();
        ingestor
            .apply(
                &EntityEvent::upsert("nova", "i-1", "nova.instance")
                    .with_relation("h1", "contains", false)
                    .with_timestamp(now),
            )
            .unwrap();
        // h1 is re-reported late, still listing the same relation.
        ingestor
            .apply(
                &EntityEvent::upsert("nova", "h1", "nova.host")
                    .with_relation("i-1", "contains", true)
                    .with_timestamp(now - TimeDelta::seconds(90)),
            )
            .unwrap();

        let edge = graph
            .get_edge(&EdgeKey::new("h1", "i-1", "contains"))
            .unwrap()
            .unwrap();
        assert_eq!(edge.timestamp, now);
    }

    #[test]
    fn test_invalid_events_are_rejected() {
        let (ingestor, graph, _) = ingestor();
        assert!(matches!(
            ingestor.apply(&EntityEvent::upsert("nova", "", "nova.host")),
            Err(ConsistencyError::Event(_))
        ));
        assert!(matches!(
            ingestor.apply(&EntityEvent::delete("", "host-1")),
            Err(ConsistencyError::Event(_))
        ));
        assert!(matches!(
            ingestor.apply(&EntityEvent::delete("nova", "missing")),
            Err(ConsistencyError::Graph(GraphError::NotFound(_)))
        ));
        assert_eq!(graph.vertex_count().unwrap(), 0);
    }

    #[test]
    fn test_decode_event() {
        let event = decode_event(
            r#"{"kind":"delete","datasource_type":"nova","identity":"h1"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.identity, "h1");

        assert!(matches!(
            decode_event("not json"),
            Err(ConsistencyError::Decode(_))
        ));
        assert!(matches!(
            decode_event(r#"{"kind":"rename","datasource_type":"nova"}"#),
            Err(ConsistencyError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_newest_when_full() {
        let (sender, mut rx) = channel(1, Backpressure::DropNewest);
        let first = sender
            .send(EntityEvent::upsert("nova", "a", "nova.host"))
            .await
            .unwrap();
        let second = sender
            .send(EntityEvent::upsert("nova", "b", "nova.host"))
            .await
            .unwrap();

        assert_eq!(first, SendOutcome::Queued);
        assert_eq!(second, SendOutcome::Dropped);
        assert_eq!(sender.dropped(), 1);
        assert_eq!(rx.recv().await.unwrap().identity, "a");
    }

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let (sender, mut rx) = channel(1, Backpressure::Block);
        sender
            .send(EntityEvent::upsert("nova", "a", "nova.host"))
            .await
            .unwrap();

        let producer = {
            let sender = sender.clone();
            tokio::spawn(async move {
                sender
                    .send(EntityEvent::upsert("nova", "b", "nova.host"))
                    .await
            })
        };

        assert_eq!(rx.recv().await.unwrap().identity, "a");
        assert_eq!(rx.recv().await.unwrap().identity, "b");
        assert_eq!(producer.await.unwrap().unwrap(), SendOutcome::Queued);
        assert_eq!(sender.dropped(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (sender, rx) = channel(4, Backpressure::Block);
        drop(rx);
        assert!(matches!(
            sender.send(EntityEvent::snapshot_end("nova")).await,
            Err(ConsistencyError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_json_lines_skips_malformed() {
        let input = concat!(
            r#"{"kind":"upsert","datasource_type":"nova","identity":"h1","type":"nova.host"}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"kind":"snapshot_end","datasource_type":"nova"}"#,
            "\n",
        );
        let (sender, mut rx) = channel(8, Backpressure::Block);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let summary = read_json_lines(input.as_bytes(), sender, shutdown_rx)
            .await
            .unwrap();

        assert_eq!(
            summary,
            ReadSummary {
                queued: 2,
                dropped: 0,
                malformed: 1
            }
        );
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Upsert);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::SnapshotEnd);
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_shutdown() {
        let (ingestor, graph, state) = ingestor();
        let (sender, rx) = channel(8, Backpressure::Block);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        sender
            .send(EntityEvent::upsert("nova", "h1", "nova.host"))
            .await
            .unwrap();
        sender
            .send(EntityEvent::delete("nova", "missing"))
            .await
            .unwrap();
        sender.send(EntityEvent::snapshot_end("nova")).await.unwrap();
        shutdown_tx.send(true).unwrap();

        let summary = ingestor.run(rx, shutdown_rx).await;

        assert_eq!(summary, IngestSummary { applied: 2, failed: 1 });
        assert!(graph.get_vertex("h1").unwrap().is_some());
        assert!(state.all_reported());
    }

    #[tokio::test]
    async fn test_run_stops_when_producers_hang_up() {
        let (ingestor, graph, _) = ingestor();
        let (sender, rx) = channel(8, Backpressure::Block);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = tokio::spawn(ingestor.run(rx, shutdown_rx));
        sender
            .send(EntityEvent::upsert("nova", "h1", "nova.host"))
            .await
            .unwrap();
        drop(sender);

        let summary = consumer.await.unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(graph.vertex_count().unwrap(), 1);
    }
}
