//! Periodic reclamation of expired limiter state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info};

use super::controller::{AdmissionController, SweepReport};
use crate::error::Result;

/// Background cleanup for an [`AdmissionController`].
///
/// Each pass runs under the same per-identifier locks as admission, so it
/// never changes the outcome of a concurrent decision.
#[derive(Debug)]
pub struct Janitor {
    controller: Arc<AdmissionController>,
    interval: Duration,
}

impl Janitor {
    pub fn new(controller: Arc<AdmissionController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    /// Use the interval from the controller's configuration.
    pub fn from_config(controller: Arc<AdmissionController>) -> Self {
        let interval = controller.config().janitor.interval();
        Self::new(controller, interval)
    }

    /// Run one pass at the controller's current time.
    pub fn run_once(&self) -> SweepReport {
        let now = self.controller.now();
        let report = self.controller.sweep(now);

        if report.is_empty() {
            debug!("Janitor pass reclaimed nothing");
        } else {
            info!(
                pruned_entries = report.pruned_entries,
                evicted_windows = report.evicted_windows,
                expired_blocks = report.expired_blocks,
                evicted_buckets = report.evicted_buckets,
                "Janitor pass completed"
            );
        }

        let stats = self.controller.aggregate_stats_at(now);
        debug!(
            tracked = stats.tracked_identifiers,
            blocked = stats.blocked,
            edge_buckets = stats.edge_buckets,
            global_usage = stats.global_usage,
            "Limiter state"
        );

        report
    }

    /// Start sweeping every interval until the handle is shut down or dropped.
    pub fn spawn(self) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = self.interval;

        let task = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Janitor started");

            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                    _ = &mut shutdown_rx => {
                        info!("Janitor shutting down");
                        break;
                    }
                }
            }
        });

        JanitorHandle { shutdown_tx, task }
    }
}

/// Owner of a running janitor task.
///
/// Dropping the handle also stops the task at its next wakeup.
#[derive(Debug)]
pub struct JanitorHandle {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Signal the task and wait for it to finish.
    pub async fn shutdown(self) -> Result<()> {
        // The task may already have exited
        let _ = self.shutdown_tx.send(());
        self.task.await?;
        Ok(())
    }

    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
