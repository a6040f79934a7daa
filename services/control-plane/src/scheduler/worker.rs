//! Scheduler background worker.
//!
//! Runs reconciliation cycles back to back with a fixed delay between the
//! end of one cycle and the start of the next, so cycles never overlap.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument};

use super::Scheduler;

/// Scheduler worker that runs the reconciliation loop.
pub struct SchedulerWorker {
    scheduler: Scheduler,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(scheduler: Scheduler, interval: Duration) -> Self {
        Self { scheduler, interval }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Starting scheduler worker"
        );

        loop {
            let stats = self.scheduler.tick().await;
            if stats.changed() {
                info!(
                    nodes_polled = stats.nodes_polled,
                    nodes_unavailable = stats.nodes_unavailable,
                    processes_lost = stats.processes_lost,
                    kills_sent = stats.kills_sent,
                    jobs_started = stats.jobs_started,
                    "Reconciliation cycle complete"
                );
            } else {
                debug!(nodes_polled = stats.nodes_polled, "Reconciliation cycle idle");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
