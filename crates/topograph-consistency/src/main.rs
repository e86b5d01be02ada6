//! CLI entry point for the topograph daemon.
//!
//! Reads newline-delimited JSON entity events from stdin, applies them to an
//! in-memory graph and runs the consistency enforcer until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

use topograph_core::config::DEFAULT_FILE_PREFIX;
use topograph_graph::PropertyGraph;

use topograph_consistency::ingest::{self, Ingestor};
use topograph_consistency::{ConsistencyConfig, ConsistencyEnforcer, DatasourceState};

#[derive(Parser)]
#[command(name = "topograph")]
#[command(about = "Entity graph daemon: ingests datasource events and enforces consistency")]
struct Cli {
    /// Config file prefix (default: topograph).
    #[arg(short, long, default_value = DEFAULT_FILE_PREFIX)]
    config: String,

    /// Datasource type that must report snapshot-end before sweeping.
    /// Repeatable; added to the configured list.
    #[arg(long = "datasource")]
    datasources: Vec<String>,

    /// Print the final graph as JSON on exit.
    #[arg(long)]
    dump_on_exit: bool,
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli));
    // A pending stdin read never completes on its own.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = ConsistencyConfig::load(&cli.config)?;
    config.datasources.extend(cli.datasources);
    config.datasources.sort();
    config.datasources.dedup();
    config.validate()?;

    let graph = Arc::new(PropertyGraph::with_config("topology", config.graph_config()));
    graph.subscribe(|prev, curr| {
        tracing::debug!(
            item = %curr.id(),
            created = prev.is_none(),
            deleted = curr.is_deleted(),
            "Graph item changed"
        );
        Ok(())
    });

    let state = Arc::new(DatasourceState::new(config.datasources.iter().cloned()));
    tracing::info!(datasources = ?config.datasources, "Topograph starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sender, receiver) = ingest::channel(config.ingest_queue_capacity, config.backpressure);

    let ingestor = Ingestor::new(graph.clone(), state.clone());
    let ingest_task = tokio::spawn(ingestor.run(receiver, shutdown_rx.clone()));

    let enforcer = ConsistencyEnforcer::new(graph.clone(), state.clone(), config)?;
    let enforcer_task = tokio::spawn(enforcer.run(shutdown_rx.clone()));

    let reader_task = tokio::spawn(ingest::read_json_lines(
        tokio::io::stdin(),
        sender,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    // Every receiver may already be gone; nothing left to notify then.
    let _ = shutdown_tx.send(true);

    match reader_task.await {
        Ok(Ok(summary)) => tracing::info!(
            queued = summary.queued,
            dropped = summary.dropped,
            malformed = summary.malformed,
            "Event reader stopped"
        ),
        Ok(Err(e)) => tracing::error!(error = %e, "Event reader failed"),
        Err(e) => tracing::error!(error = %e, "Event reader task panicked"),
    }
    if let Err(e) = ingest_task.await {
        tracing::error!(error = %e, "Ingestion task panicked");
    }
    if let Err(e) = enforcer_task.await {
        tracing::error!(error = %e, "Enforcer task panicked");
    }

    tracing::info!(
        vertices = graph.vertex_count()?,
        edges = graph.edge_count()?,
        "Topograph stopped"
    );
    if cli.dump_on_exit {
        println!("{}", serde_json::to_string_pretty(&graph.to_json()?)?);
    }

    Ok(())
}
