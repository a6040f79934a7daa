//! Job scheduler.
//!
//! The scheduler owns the fleet bindings and the job book behind a single
//! async mutex and drives jobs through their lifecycle:
//! - Admitting submissions and preparing their build checkout
//! - Reconciling bound processes against what nodes report as alive
//! - Killing the leftover processes of stopping jobs
//! - Launching the head of the FIFO schedule once it fits
//!
//! Gateway calls and store writes are the only suspension points besides
//! lock acquisition. The poll of node processes runs unlocked against the
//! fixed node targets; every other step of a cycle runs with the lock held.

mod admission;
mod launch;
mod reconciler;
mod state;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use pit_id::{JobId, NodeId};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::gateway::{GatewayClient, ScriptEnv, Target};
use crate::job::{JobBook, JobState};
use crate::registry::{Fleet, NodeState};
use crate::request::{JsonRequestParser, RequestParser};
use crate::store::{StateStore, StateStoreError};

pub use admission::{DeleteError, Requester, SubmitError};
pub use reconciler::TickStats;
pub use state::{JobProcesses, SchedulerState};
pub use worker::SchedulerWorker;

/// Host-side directories handed to the scripts.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Build cache passed to `prepare` as `CACHE_DIR`.
    pub cache_dir: PathBuf,
    /// Parent of the per-job working directories.
    pub jobs_dir: PathBuf,
}

impl SchedulerSettings {
    pub fn new(cache_dir: impl Into<PathBuf>, jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            jobs_dir: jobs_dir.into(),
        }
    }

    /// Working directory of a job: `<jobs_dir>/<id>`.
    pub fn job_dir(&self, job: JobId) -> PathBuf {
        self.jobs_dir.join(job.to_string())
    }
}

/// Handle to the scheduler. Clones share the same state.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    store: Option<Arc<Mutex<StateStore>>>,
    poll_targets: Arc<Vec<(Target, ScriptEnv)>>,
    gateway: GatewayClient,
    parser: Arc<dyn RequestParser>,
    settings: Arc<SchedulerSettings>,
}

impl Scheduler {
    /// Create a scheduler with no persisted state.
    pub fn new(fleet: Fleet, gateway: GatewayClient, settings: SchedulerSettings) -> Self {
        Self {
            poll_targets: Arc::new(poll_targets(&fleet)),
            state: Arc::new(Mutex::new(SchedulerState::new(fleet, JobBook::new()))),
            store: None,
            gateway,
            parser: Arc::new(JsonRequestParser),
            settings: Arc::new(settings),
        }
    }

    /// Create a scheduler backed by `store`, resuming from its saved state.
    ///
    /// Jobs saved while preparing have their preparation restarted, so this
    /// must be called from within a tokio runtime.
    pub fn restore(
        mut fleet: Fleet,
        gateway: GatewayClient,
        settings: SchedulerSettings,
        store: StateStore,
    ) -> Result<Self, StateStoreError> {
        let jobs = match store.load()? {
            Some(persisted) => {
                persisted.apply_bindings(&mut fleet);
                info!(
                    jobs = persisted.jobs.len(),
                    bindings = persisted.bindings.len(),
                    "Restored scheduler state"
                );
                persisted.jobs
            }
            None => JobBook::new(),
        };
        let interrupted: Vec<_> = jobs
            .jobs()
            .filter(|job| job.state == JobState::Preparing)
            .map(|job| (job.id, job.build.clone()))
            .collect();

        let scheduler = Self {
            poll_targets: Arc::new(poll_targets(&fleet)),
            state: Arc::new(Mutex::new(SchedulerState::new(fleet, jobs))),
            store: Some(Arc::new(Mutex::new(store))),
            gateway,
            parser: Arc::new(JsonRequestParser),
            settings: Arc::new(settings),
        };

        for (id, build) in interrupted {
            info!(job_id = %id, "Restarting interrupted preparation");
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler.prepare(id, build).await;
            });
        }

        Ok(scheduler)
    }

    /// Replace the cluster request parser.
    pub fn with_parser(mut self, parser: Arc<dyn RequestParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Apply an externally classified node state.
    pub async fn set_node_state(&self, node: &NodeId, state: NodeState) -> bool {
        let mut guard = self.state.lock().await;
        let Some(entry) = guard.fleet.node_mut(node) else {
            return false;
        };
        if entry.state != state {
            info!(node_id = %node, from = %entry.state, to = %state, "Node state changed");
            entry.state = state;
        }
        true
    }

    /// Write the state to the store, if any, releasing the state lock first.
    ///
    /// The store lock is taken before the state lock is released, so saves
    /// land in the order the state was mutated. Failures are logged only.
    async fn persist(&self, state: MutexGuard<'_, SchedulerState>) {
        let Some(store) = &self.store else {
            return;
        };
        let jobs = state.jobs.clone();
        let fleet = state.fleet.clone();
        let store = store.clone().lock_owned().await;
        drop(state);

        match tokio::task::spawn_blocking(move || store.save(&jobs, &fleet)).await {
            Ok(Ok(())) => debug!("Persisted scheduler state"),
            Ok(Err(e)) => warn!(error = %e, "Failed to persist scheduler state"),
            Err(e) => warn!(error = %e, "State store task failed"),
        }
    }
}

/// Pids query target and environment of every node, in fleet order.
fn poll_targets(fleet: &Fleet) -> Vec<(Target, ScriptEnv)> {
    fleet
        .nodes
        .iter()
        .map(|node| {
            let mut env = ScriptEnv::new();
            if let Some(user) = &node.user {
                env.insert("RUN_USER".to_string(), user.clone());
            }
            (Target::node(node), env)
        })
        .collect()
}
