//! One reconciliation cycle.
//!
//! A cycle runs four steps in order:
//! 1. Poll: ask every node for its live pids, without holding the lock
//! 2. Reconcile: free bound pids the nodes no longer report and stop their jobs
//! 3. Stop: kill the surviving processes of stopping and deleted jobs
//! 4. Admit: launch the head of the schedule if it fits on online nodes
//!
//! Only the schedule head is ever considered, so a job that does not fit
//! blocks everything queued behind it.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use pit_id::{NodeId, Pid};
use pit_reconcile::NodeReport;
use tracing::{debug, info, instrument, warn};

use super::Scheduler;
use crate::gateway::{Script, ScriptEnv, Target};
use crate::job::JobState;
use crate::registry::NodeState;

/// Counters of a single cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub nodes_polled: usize,
    pub nodes_unavailable: usize,
    pub processes_lost: usize,
    pub kills_sent: usize,
    pub heads_dropped: usize,
    pub jobs_started: usize,
}

impl TickStats {
    /// Whether the cycle changed any scheduler state.
    pub fn changed(&self) -> bool {
        self.processes_lost > 0 || self.heads_dropped > 0 || self.jobs_started > 0
    }
}

impl Scheduler {
    /// Run one reconciliation cycle.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> TickStats {
        let mut stats = TickStats::default();

        let reports = self.poll(&mut stats).await;

        let mut state = self.state.lock().await;

        // Reconcile
        let unavailable = NodeReport::Unavailable;
        for (job, nodes) in state.job_processes() {
            for (node, pids) in nodes {
                let report = reports.get(&node).unwrap_or(&unavailable);
                for pid in pids {
                    if report.observe(pid).is_alive() {
                        continue;
                    }
                    info!(job_id = %job, node_id = %node, %pid, "Process is gone");
                    state.jobs.transition(job, JobState::Stopping);
                    state.free_process(&node, pid);
                    stats.processes_lost += 1;
                }
            }
        }

        // Stop
        let mut kills: Vec<(Target, Pid)> = Vec::new();
        for (job, nodes) in state.job_processes() {
            match state.jobs.state(job) {
                Some(JobState::Stopping) => {}
                None => debug!(job_id = %job, "Reclaiming processes of deleted job"),
                Some(_) => continue,
            }
            for (node, pids) in nodes {
                let Some(entry) = state.fleet.node(&node) else {
                    continue;
                };
                kills.extend(pids.into_iter().map(|pid| (Target::node(entry), pid)));
            }
        }
        if !kills.is_empty() {
            stats.kills_sent = kills.len();
            join_all(kills.iter().map(|(target, pid)| {
                let mut env = ScriptEnv::new();
                env.insert("PID".to_string(), pid.to_string());
                self.gateway.call(target, Script::Kill, env)
            }))
            .await;
        }

        // Admit
        if let Some(head) = state.jobs.head() {
            match state.jobs.get(head).map(|job| job.request.clone()) {
                None => {
                    state.jobs.pop_head();
                    stats.heads_dropped += 1;
                    debug!(job_id = %head, "Dropped deleted job from schedule");
                }
                Some(request) => match state.reserve(&request, NodeState::Online) {
                    Some(reservations) => {
                        state.jobs.pop_head();
                        self.launch(&mut state, head, reservations).await;
                        stats.jobs_started += 1;
                    }
                    None => debug!(job_id = %head, "Schedule head does not fit yet"),
                },
            }
        }

        if stats.changed() {
            self.persist(state).await;
        }

        stats
    }

    /// Query every node for its live processes concurrently.
    ///
    /// Runs without the scheduler lock; node targets never change after start.
    async fn poll(&self, stats: &mut TickStats) -> BTreeMap<NodeId, NodeReport> {
        let targets = self.poll_targets.as_slice();
        let outputs = join_all(
            targets
                .iter()
                .map(|(target, env)| self.gateway.call(target, Script::Pids, env.clone())),
        )
        .await;

        let mut reports = BTreeMap::new();
        for ((target, _), output) in targets.iter().zip(outputs) {
            let Some(node) = target.node_id() else {
                continue;
            };
            let report = NodeReport::from_output(output.exit_code, &output.stdout);
            if report.is_unavailable() {
                warn!(node_id = %node, exit_code = output.exit_code, "Node did not report its processes");
                stats.nodes_unavailable += 1;
            } else {
                debug!(node_id = %node, live = report.live_count(), "Node reported its processes");
            }
            reports.insert(node.clone(), report);
        }
        stats.nodes_polled = reports.len();
        reports
    }
}
