//! Job admission: submit, prepare, delete and read-only snapshots.

use pit_id::{JobId, UserId};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::Scheduler;
use crate::gateway::{Script, ScriptEnv, Target};
use crate::job::{BuildRef, Job, JobState};
use crate::registry::{Fleet, NodeState};
use crate::request::ParseError;

/// Reasons a submission is rejected. No job exists afterwards.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("cluster request cannot be satisfied by the fleet")]
    Infeasible,
}

/// Reasons a deletion is refused.
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("user {requester} may not delete job {job}")]
    Forbidden { job: JobId, requester: UserId },
}

/// The authenticated caller of an admission operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub user: UserId,
    pub admin: bool,
}

impl Requester {
    pub fn user(user: UserId) -> Self {
        Self { user, admin: false }
    }

    pub fn admin(user: UserId) -> Self {
        Self { user, admin: true }
    }

    fn may_manage(&self, job: &Job) -> bool {
        self.admin || job.user == self.user
    }
}

impl Scheduler {
    /// Parse and admit a job, then start preparing it in the background.
    ///
    /// The request must fit the free slots of nodes in any state. Nothing is
    /// claimed here; placement is redone against online nodes at launch.
    #[instrument(skip(self, request_text, build, description), fields(user = %requester.user))]
    pub async fn submit(
        &self,
        request_text: &str,
        build: BuildRef,
        description: Option<String>,
        requester: &Requester,
    ) -> Result<JobId, SubmitError> {
        let request = self.parser.parse(request_text)?;

        let mut state = self.state.lock().await;
        if state.reserve(&request, NodeState::Unknown).is_none() {
            info!("Rejecting infeasible job");
            return Err(SubmitError::Infeasible);
        }
        let id = state.jobs.allocate_id();
        state.jobs.insert(Job::new(
            id,
            requester.user.clone(),
            build.clone(),
            description,
            request,
        ));
        self.persist(state).await;

        info!(job_id = %id, origin = %build.origin, hash = %build.hash, "Job submitted");

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.prepare(id, build).await;
        });

        Ok(id)
    }

    /// Check out a job's build on the control-plane host.
    ///
    /// Success requires exit 0 and an existing job directory. A job deleted
    /// while preparing stays deleted.
    #[instrument(skip(self, build))]
    pub(crate) async fn prepare(&self, id: JobId, build: BuildRef) {
        let job_dir = self.settings.job_dir(id);
        let mut env = ScriptEnv::new();
        env.insert("CACHE_DIR".to_string(), self.settings.cache_dir.display().to_string());
        env.insert("JOBS_DIR".to_string(), self.settings.jobs_dir.display().to_string());
        env.insert("JOB_NAME".to_string(), id.to_string());
        env.insert("ORIGIN".to_string(), build.origin);
        env.insert("HASH".to_string(), build.hash);
        env.insert("DIFF".to_string(), build.diff);

        let output = self.gateway.call(&Target::Local, Script::Prepare, env).await;
        let dir_exists = tokio::fs::try_exists(&job_dir).await.unwrap_or(false);

        let mut state = self.state.lock().await;
        match state.jobs.state(id) {
            None => {
                info!(job_id = %id, "Job deleted during preparation");
                return;
            }
            Some(JobState::Preparing) => {}
            Some(current) => {
                debug!(job_id = %id, state = %current, "Ignoring stale preparation result");
                return;
            }
        }

        if output.is_success() && dir_exists {
            state.jobs.transition(id, JobState::Waiting);
            state.jobs.enqueue(id);
            info!(job_id = %id, "Job prepared and queued");
        } else {
            let result = if output.is_success() {
                format!("job directory {} was not created", job_dir.display())
            } else {
                output.stderr
            };
            warn!(job_id = %id, exit_code = output.exit_code, "Job preparation failed");
            if let Some(job) = state.jobs.get_mut(id) {
                job.result = Some(result);
            }
            state.jobs.transition(id, JobState::Failed);
        }
        self.persist(state).await;
    }

    /// Remove a job record and its queue entry.
    ///
    /// Slots still bound to the job are reclaimed by later cycles.
    #[instrument(skip(self), fields(user = %requester.user))]
    pub async fn delete(&self, id: JobId, requester: &Requester) -> Result<(), DeleteError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get(id).ok_or(DeleteError::NotFound(id))?;
        if !requester.may_manage(job) {
            return Err(DeleteError::Forbidden {
                job: id,
                requester: requester.user.clone(),
            });
        }
        if let Some(job) = state.jobs.remove(id) {
            info!(job_id = %id, state = %job.state, "Job deleted");
        }
        self.persist(state).await;
        Ok(())
    }

    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.state.lock().await.jobs.get(id).cloned()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.state.lock().await.jobs.jobs().cloned().collect()
    }

    /// Queued job ids, head first.
    pub async fn schedule(&self) -> Vec<JobId> {
        self.state.lock().await.jobs.schedule().collect()
    }

    pub async fn fleet(&self) -> Fleet {
        self.state.lock().await.fleet.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::gateway::{GatewayClient, MockGateway};
    use crate::registry::{Node, Resource};
    use crate::scheduler::SchedulerSettings;

    fn scheduler(dir: &tempfile::TempDir) -> Scheduler {
        let fleet = Fleet::new(vec![
            Node::new("n1".parse().unwrap(), NodeState::Online).with_resource(Resource::new("gpu"))
        ]);
        Scheduler::new(
            fleet,
            GatewayClient::new(Arc::new(MockGateway::new()), Duration::from_secs(1)),
            SchedulerSettings::new(dir.path().join("cache"), dir.path().join("jobs")),
        )
    }

    #[tokio::test]
    async fn test_deleted_job_is_not_resurrected_by_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(&dir);
        let alice = Requester::user("alice".parse().unwrap());
        let request = r#"[{"count": 1, "process": [{"name": "gpu", "count": 1}]}]"#;

        let id = scheduler
            .submit(request, BuildRef::new("origin", "hash"), None, &alice)
            .await
            .unwrap();
        scheduler.delete(id, &alice).await.unwrap();
        scheduler.prepare(id, BuildRef::new("origin", "hash")).await;

        assert!(scheduler.job(id).await.is_none());
        assert!(scheduler.schedule().await.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_is_applied_once() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(&dir);
        let alice = Requester::user("alice".parse().unwrap());
        let request = r#"[{"count": 1, "process": [{"name": "gpu", "count": 1}]}]"#;

        let id = scheduler
            .submit(request, BuildRef::new("origin", "hash"), None, &alice)
            .await
            .unwrap();
        scheduler.prepare(id, BuildRef::new("origin", "hash")).await;
        scheduler.prepare(id, BuildRef::new("origin", "hash")).await;

        assert_eq!(scheduler.job(id).await.unwrap().state, JobState::Waiting);
        assert_eq!(scheduler.schedule().await, vec![id]);
    }

    #[test]
    fn test_requester_permissions() {
        let job = Job::new(
            JobId::new(1),
            "alice".parse().unwrap(),
            BuildRef::default(),
            None,
            Default::default(),
        );
        assert!(Requester::user("alice".parse().unwrap()).may_manage(&job));
        assert!(!Requester::user("bob".parse().unwrap()).may_manage(&job));
        assert!(Requester::admin("root".parse().unwrap()).may_manage(&job));
    }
}
