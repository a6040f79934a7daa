//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pit_control_plane::gateway::{GatewayClient, MockGateway};
use pit_control_plane::job::{BuildRef, JobState};
use pit_control_plane::registry::{Fleet, Node, NodeState, Resource, CUDA_TYPE};
use pit_control_plane::scheduler::{Requester, Scheduler, SchedulerSettings};
use pit_control_plane::store::StateStore;
use pit_id::{JobId, NodeId};
use tempfile::TempDir;

pub struct Harness {
    pub scheduler: Scheduler,
    pub mock: Arc<MockGateway>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(fleet: Fleet) -> Self {
        Self::with_first_pid(fleet, 1000)
    }

    pub fn with_first_pid(fleet: Fleet, pid: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockGateway::with_first_pid(pid));
        let scheduler = Scheduler::new(fleet, client(&mock), settings(&dir));
        Self { scheduler, mock, dir }
    }

    /// Scheduler persisting into `<dir>/state.db`, resuming whatever is there.
    pub fn persistent(fleet: Fleet, mock: Arc<MockGateway>, dir: TempDir) -> Self {
        let store = StateStore::open(dir.path().join("state.db")).unwrap();
        let scheduler = Scheduler::restore(fleet, client(&mock), settings(&dir), store).unwrap();
        Self { scheduler, mock, dir }
    }

    /// Submit as alice and wait until the job is queued.
    pub async fn submit_ready(&self, request: &str) -> JobId {
        let id = self
            .scheduler
            .submit(request, build(), None, &alice())
            .await
            .unwrap();
        self.wait_for_state(id, JobState::Waiting).await;
        id
    }

    pub async fn state(&self, id: JobId) -> Option<JobState> {
        self.scheduler.job(id).await.map(|job| job.state)
    }

    pub async fn wait_for_state(&self, id: JobId, expected: JobState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let state = self.state(id).await;
            if state == Some(expected) {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {id} did not reach {expected}; last state {state:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn owned_slots(&self, id: JobId) -> usize {
        self.scheduler.fleet().await.owned_by(id)
    }
}

fn client(mock: &Arc<MockGateway>) -> GatewayClient {
    GatewayClient::new(mock.clone(), Duration::from_secs(5))
}

fn settings(dir: &TempDir) -> SchedulerSettings {
    SchedulerSettings::new(dir.path().join("cache"), dir.path().join("jobs"))
}

pub fn node_id(id: &str) -> NodeId {
    id.parse().unwrap()
}

/// Online node with `gpus` CUDA slots followed by `cpus` cpu slots.
pub fn node(id: &str, gpus: u32, cpus: u32) -> Node {
    let mut node = Node::new(node_id(id), NodeState::Online);
    for index in 0..gpus {
        node = node.with_resource(Resource::new("gpu").with_hardware(CUDA_TYPE, index));
    }
    for _ in 0..cpus {
        node = node.with_resource(Resource::new("cpu"));
    }
    node
}

/// `count` processes of `gpus` gpus each.
pub fn gpu_request(count: u32, gpus: u32) -> String {
    format!(r#"[{{"count": {count}, "process": [{{"name": "gpu", "count": {gpus}}}]}}]"#)
}

pub fn build() -> BuildRef {
    BuildRef::new("https://git.example.com/ml/trainer.git", "9f2c1e7")
}

pub fn alice() -> Requester {
    Requester::user("alice".parse().unwrap())
}
