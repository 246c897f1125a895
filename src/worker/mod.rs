//! Drain/dispatch loop.
//!
//! Drains the intake queue, collapses duplicate (participant, level) keys,
//! and fans the distinct keys out to the updater in bounded concurrent
//! batches. A failing unit is logged and dropped; the pair stays stale until
//! the next notification re-enqueues it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::bus::{ChangeNotifier, BEST_CHANGED_ROUTING_KEY};
use crate::queue::{IntakeQueue, UpdateRequest};
use crate::store::BestRecordUpdater;

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of update units run concurrently per batch.
    pub batch_size: usize,
    /// Sleep between cycles when the queue is empty, in milliseconds.
    pub idle_poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            idle_poll_interval_ms: 1000,
        }
    }
}

/// The long-running control loop.
pub struct QueueWorker {
    queue: Arc<IntakeQueue>,
    updater: Arc<dyn BestRecordUpdater>,
    notifier: Arc<dyn ChangeNotifier>,
    config: WorkerConfig,
}

impl QueueWorker {
    /// Create a new worker over the given collaborators.
    pub fn new(
        queue: Arc<IntakeQueue>,
        updater: Arc<dyn BestRecordUpdater>,
        notifier: Arc<dyn ChangeNotifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            updater,
            notifier,
            config,
        }
    }

    /// Run until the shutdown signal flips to true (or its sender drops).
    ///
    /// Shutdown is observed at the top of each cycle and during the idle
    /// sleep; in-flight batches always run to completion first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            idle_poll_interval_ms = self.config.idle_poll_interval_ms,
            "Queue worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_cycle().await;

            // Drain bursts promptly; only sleep when nothing is pending.
            if self.queue.has_pending() {
                continue;
            }

            let idle = Duration::from_millis(self.config.idle_poll_interval_ms);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(idle) => {}
            }
        }

        info!("Queue worker stopped");
    }

    /// One drain-group-dispatch cycle.
    async fn run_cycle(&self) {
        let drained = self.queue.drain_all();
        if drained.is_empty() {
            return;
        }

        let total = drained.len();
        // One recomputation per distinct pair: the updater reads current
        // store state, so queued duplicates carry no extra information.
        let distinct: Vec<UpdateRequest> = drained
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        debug!(
            drained = total,
            distinct = distinct.len(),
            "Dispatching personal best updates"
        );

        // chunks() panics on zero
        let batch_size = self.config.batch_size.max(1);
        for batch in distinct.chunks(batch_size) {
            join_all(batch.iter().map(|request| self.run_unit(*request))).await;
        }
    }

    /// One unit of work: recompute, then announce changed ids post-commit.
    async fn run_unit(&self, request: UpdateRequest) {
        let changed = match self
            .updater
            .update(request.participant_id, request.level_id)
            .await
        {
            Ok(changed) => changed,
            Err(e) => {
                error!(
                    participant_id = request.participant_id,
                    level_id = request.level_id,
                    error = %e,
                    "Personal best update failed, pair stays stale until re-notified"
                );
                return;
            }
        };

        if changed.is_empty() {
            return;
        }

        debug!(
            participant_id = request.participant_id,
            level_id = request.level_id,
            changed = changed.len(),
            "Personal best updated"
        );

        for record_id in changed {
            // Best-effort: the store change is already committed.
            if let Err(e) = self
                .notifier
                .publish(BEST_CHANGED_ROUTING_KEY, record_id)
                .await
            {
                error!(record_id, error = %e, "Failed to publish change notification");
            }
        }
    }
}
