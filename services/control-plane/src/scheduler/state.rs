//! Mutable scheduler state: the fleet's slot bindings and the job book.
//!
//! Everything here runs under the scheduler lock. Slot ownership only changes
//! through [`SchedulerState::claim`], [`SchedulerState::bind`],
//! [`SchedulerState::release_claims`] and [`SchedulerState::free_process`];
//! the two releasing paths share the completion rule: a Stopping job whose
//! owned-slot count drops from non-zero to zero becomes Done.

use std::collections::{BTreeMap, BTreeSet};

use pit_id::{JobId, NodeId, Pid};
use tracing::{debug, info};

use crate::job::{JobBook, JobState};
use crate::planner::{self, Reservation};
use crate::registry::{Fleet, NodeState};
use crate::request::ClusterRequest;

/// Bound processes grouped by job, then by node.
pub type JobProcesses = BTreeMap<JobId, BTreeMap<NodeId, BTreeSet<Pid>>>;

#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub fleet: Fleet,
    pub jobs: JobBook,
}

impl SchedulerState {
    pub fn new(fleet: Fleet, jobs: JobBook) -> Self {
        Self { fleet, jobs }
    }

    /// Reserve a request against the current bindings.
    pub fn reserve(&self, request: &ClusterRequest, min_state: NodeState) -> Option<Vec<Reservation>> {
        planner::reserve(&self.fleet, request, min_state)
    }

    /// Bound pids on online nodes. Bindings on other nodes wait for a later cycle.
    pub fn job_processes(&self) -> JobProcesses {
        let mut processes = JobProcesses::new();
        for node in self.fleet.nodes.iter().filter(|n| n.state >= NodeState::Online) {
            for slot in &node.resources {
                if let (Some(job), Some(pid)) = (slot.job, slot.pid) {
                    processes
                        .entry(job)
                        .or_default()
                        .entry(node.id.clone())
                        .or_default()
                        .insert(pid);
                }
            }
        }
        processes
    }

    pub fn owned_count(&self, job: JobId) -> usize {
        self.fleet.owned_by(job)
    }

    /// Mark reserved slots as owned by `job`, without a pid yet.
    pub fn claim(&mut self, job: JobId, reservation: &Reservation) {
        if let Some(node) = self.fleet.node_mut(&reservation.node) {
            for index in &reservation.resources {
                if let Some(slot) = node.resources.get_mut(*index) {
                    slot.job = Some(job);
                    slot.pid = None;
                }
            }
        }
    }

    /// Attach a launched process to the slots of its reservation.
    pub fn bind(&mut self, job: JobId, reservation: &Reservation, pid: Pid) {
        if let Some(node) = self.fleet.node_mut(&reservation.node) {
            for index in &reservation.resources {
                if let Some(slot) = node.resources.get_mut(*index) {
                    slot.job = Some(job);
                    slot.pid = Some(pid);
                }
            }
        }
        debug!(job_id = %job, node_id = %reservation.node, %pid, "Process bound");
    }

    /// Release claims of a reservation whose launch failed.
    pub fn release_claims(&mut self, job: JobId, reservation: &Reservation) -> usize {
        let before = self.owned_count(job);
        let mut released = 0;
        if let Some(node) = self.fleet.node_mut(&reservation.node) {
            for index in &reservation.resources {
                if let Some(slot) = node.resources.get_mut(*index) {
                    if slot.job == Some(job) && slot.pid.is_none() {
                        slot.clear();
                        released += 1;
                    }
                }
            }
        }
        self.complete_if_released(job, before);
        released
    }

    /// Clear every slot on `node` bound to `pid` and apply the completion rule
    /// to the jobs that owned them.
    ///
    /// Pids are node-local, so slots on other nodes are never touched.
    /// Freeing an unknown pid is a no-op.
    pub fn free_process(&mut self, node: &NodeId, pid: Pid) -> usize {
        let Some(entry) = self.fleet.node(node) else {
            return 0;
        };
        let owners: BTreeSet<JobId> = entry
            .resources
            .iter()
            .filter(|slot| slot.pid == Some(pid))
            .filter_map(|slot| slot.job)
            .collect();
        let before: Vec<(JobId, usize)> = owners.iter().map(|job| (*job, self.owned_count(*job))).collect();

        let mut freed = 0;
        if let Some(entry) = self.fleet.node_mut(node) {
            for slot in entry.resources.iter_mut() {
                if slot.pid == Some(pid) {
                    slot.clear();
                    freed += 1;
                }
            }
        }
        if freed > 0 {
            debug!(node_id = %node, %pid, slots = freed, "Process freed");
        }

        for (job, before) in before {
            self.complete_if_released(job, before);
        }
        freed
    }

    fn complete_if_released(&mut self, job: JobId, before: usize) {
        if before == 0 || self.owned_count(job) > 0 {
            return;
        }
        if self.jobs.state(job) == Some(JobState::Stopping) {
            self.jobs.transition(job, JobState::Done);
            info!(job_id = %job, "Job released all resources");
        }
    }
}
