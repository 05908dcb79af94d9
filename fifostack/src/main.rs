//! fifostack - local FIFO message queue
//!
//! Serves SQS-compatible FIFO queues over the AWS JSON 1.0 protocol, with
//! optional queues and event source mappings declared in a config file.

mod config;
mod router;

use anyhow::Context;
use clap::Parser;
use fifostack_sqs::{spawn_sweeper, EventSourceMapping, LoggingProcessor, RecordHandler, SqsStorage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "fifostack")]
#[command(about = "Local FIFO message queue with an SQS-compatible API", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "FIFOSTACK_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "FIFOSTACK_PORT")]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "FIFOSTACK_HOST")]
    host: Option<String>,

    /// Interval between retention and lease sweeps, in milliseconds
    #[arg(long, env = "FIFOSTACK_SWEEP_INTERVAL_MS")]
    sweep_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FIFOSTACK_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "fifostack={0},fifostack_sqs={0},tower_http=debug",
                    args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config::Config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(interval) = args.sweep_interval_ms {
        config.server.sweep_interval_ms = interval;
    }

    info!("Starting fifostack...");

    let storage = Arc::new(SqsStorage::with_endpoint(config.server.endpoint_url()));
    for definition in &config.queues {
        storage
            .create_queue(&definition.name, definition.config.clone())
            .with_context(|| format!("creating queue {}", definition.name))?;
    }

    let sweeper = spawn_sweeper(
        storage.clone(),
        Duration::from_millis(config.server.sweep_interval_ms.max(1)),
    );

    let mut mappings = Vec::with_capacity(config.event_sources.len());
    for source in &config.event_sources {
        let queue = storage
            .get_queue(&source.queue)
            .with_context(|| format!("event source for {}", source.queue))?;
        let mapping = EventSourceMapping::new(queue, Arc::new(RecordHandler::new(LoggingProcessor)))
            .with_batch_size(source.batch_size)?
            .with_wait_time(Duration::from_secs(source.wait_time_seconds))?
            .with_region(storage.region());
        mappings.push(mapping.spawn());
    }

    let app = router::create_router(storage);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }
        })
        .await?;

    for mapping in mappings {
        mapping.shutdown().await;
    }
    sweeper.abort();

    Ok(())
}
