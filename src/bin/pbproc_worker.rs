//! pbproc-worker: Personal best consolidation worker
//!
//! Consumes record-submitted notifications from AMQP, recomputes personal
//! bests per (participant, level) pair against the store, and publishes
//! best-changed notifications back to AMQP.
//!
//! ## Architecture
//! ```text
//! [AMQP records.submitted] -> [IntakeQueue] -> [QueueWorker]
//!                                                   |
//!                                                   v
//!                                             [RecordStore]
//!                                                   |
//!                                                   v
//!                                 [AMQP records.best-changed]
//! ```
//!
//! ## Configuration
//! - PBPROC_CONFIG: path to a YAML config file
//! - PBPROC__MESSAGING__URL: RabbitMQ connection string
//! - PBPROC__STORAGE__PATH: database path
//! - PBPROC_LOG: log filter (default: info)

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pbproc::bus::{AmqpChangeNotifier, AmqpConfig, AmqpIntake};
use pbproc::config::{Config, LOG_ENV_VAR};
use pbproc::queue::IntakeQueue;
use pbproc::store::init_store;
use pbproc::worker::QueueWorker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting pbproc-worker");

    let updater = init_store(&config.storage).await?;

    let notifier = Arc::new(
        AmqpChangeNotifier::new(AmqpConfig::publisher(&config.messaging.url)).await?,
    );

    let queue = Arc::new(IntakeQueue::new());
    let intake = AmqpIntake::new(
        AmqpConfig::intake(&config.messaging.url, &config.messaging.intake_queue),
        Arc::clone(&queue),
    )
    .await?;
    intake.start_consuming()?;

    let worker = QueueWorker::new(queue, updater, notifier, config.worker.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    info!("Worker running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown requested, finishing in-flight work");
    shutdown_tx.send(true)?;
    worker_handle.await?;

    Ok(())
}
