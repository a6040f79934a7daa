//! Launching an admitted job's process instances.

use futures_util::future::join_all;
use pit_id::JobId;
use pit_reconcile::first_pid;
use tracing::{info, warn};

use super::{Scheduler, SchedulerState};
use crate::gateway::{Script, ScriptEnv, Target};
use crate::job::JobState;
use crate::planner::Reservation;

/// One `run` call to make.
struct Instance {
    index: usize,
    reservation: Reservation,
    target: Target,
    env: ScriptEnv,
}

impl Scheduler {
    /// Launch every reservation of `job` concurrently.
    ///
    /// Slots are claimed before the calls go out. A successful call binds its
    /// pid; a failed one stops the job and releases its own claim. The job
    /// ends Running only if no instance failed.
    pub(super) async fn launch(&self, state: &mut SchedulerState, job: JobId, reservations: Vec<Reservation>) {
        state.jobs.transition(job, JobState::Starting);
        for reservation in &reservations {
            state.claim(job, reservation);
        }

        let job_dir = self.settings.job_dir(job).display().to_string();
        let instances: Vec<Instance> = reservations
            .into_iter()
            .enumerate()
            .filter_map(|(index, reservation)| {
                let node = state.fleet.node(&reservation.node)?;
                let devices: Vec<String> = reservation
                    .resources
                    .iter()
                    .filter_map(|slot| node.resources.get(*slot).and_then(|r| r.cuda_index()))
                    .map(|i| i.to_string())
                    .collect();

                let mut env = ScriptEnv::new();
                env.insert("JOB_NUMBER".to_string(), job.to_string());
                env.insert("JOB_DIR".to_string(), job_dir.clone());
                env.insert("PROCESS_INDEX".to_string(), index.to_string());
                env.insert("CUDA_VISIBLE_DEVICES".to_string(), devices.join(","));

                Some(Instance {
                    index,
                    target: Target::node(node),
                    reservation,
                    env,
                })
            })
            .collect();

        info!(job_id = %job, instances = instances.len(), "Launching job");

        let outputs = join_all(
            instances
                .iter()
                .map(|i| self.gateway.call(&i.target, Script::Run, i.env.clone())),
        )
        .await;

        for (instance, output) in instances.iter().zip(outputs) {
            let pid = if output.is_success() { first_pid(&output.stdout) } else { None };
            match pid {
                Some(pid) => state.bind(job, &instance.reservation, pid),
                None => {
                    warn!(
                        job_id = %job,
                        node_id = %instance.reservation.node,
                        process_index = instance.index,
                        exit_code = output.exit_code,
                        "Process failed to launch"
                    );
                    state.jobs.transition(job, JobState::Stopping);
                    state.release_claims(job, &instance.reservation);
                }
            }
        }

        if state.jobs.state(job) == Some(JobState::Starting) {
            state.jobs.transition(job, JobState::Running);
        }
    }
}
