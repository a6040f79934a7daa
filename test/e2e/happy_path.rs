//! End-to-end tests running the real script transport on the local host.
//!
//! `prepare` and `run` are stand-ins written into a temporary scripts
//! directory; `pids` and `kill` are the shipped scripts. Each job process is
//! a `sleep` started by `run.sh`.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pit_control_plane::gateway::{GatewayClient, ScriptGateway};
use pit_control_plane::job::{BuildRef, JobState};
use pit_control_plane::registry::{Fleet, Node, NodeState, Resource, CUDA_TYPE};
use pit_control_plane::scheduler::{Requester, Scheduler, SchedulerSettings};
use pit_id::{JobId, Pid};
use tempfile::TempDir;

const PREPARE: &str = r#"mkdir -p "$JOBS_DIR/$JOB_NAME""#;

const RUN: &str = r#"
echo "$CUDA_VISIBLE_DEVICES" > "$JOB_DIR/devices-$PROCESS_INDEX"
sleep 30 > /dev/null 2>&1 < /dev/null &
echo "launching"
echo "pid:$!"
"#;

fn shipped_script(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../scripts")
        .join(name)
}

struct Setup {
    scheduler: Scheduler,
    dir: TempDir,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("prepare.sh"), PREPARE).unwrap();
    std::fs::write(scripts.join("run.sh"), RUN).unwrap();
    for name in ["pids.sh", "kill.sh"] {
        std::fs::copy(shipped_script(name), scripts.join(name)).unwrap();
    }

    let fleet = Fleet::new(vec![Node::new("local".parse().unwrap(), NodeState::Online)
        .with_resource(Resource::new("gpu").with_hardware(CUDA_TYPE, 0))
        .with_resource(Resource::new("gpu").with_hardware(CUDA_TYPE, 1))]);
    let gateway = GatewayClient::new(Arc::new(ScriptGateway::new(&scripts)), Duration::from_secs(10));
    let settings = SchedulerSettings::new(dir.path().join("cache"), dir.path().join("jobs"));

    Setup {
        scheduler: Scheduler::new(fleet, gateway, settings),
        dir,
    }
}

fn requester() -> Requester {
    Requester::user("alice".parse().unwrap())
}

async fn wait_for_state(scheduler: &Scheduler, id: JobId, expected: JobState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let state = scheduler.job(id).await.map(|job| job.state);
        if state == Some(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} did not reach {expected}; last state {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Tick until the job owns no slots.
async fn tick_until_released(scheduler: &Scheduler, id: JobId) {
    for _ in 0..50 {
        scheduler.tick().await;
        if scheduler.fleet().await.owned_by(id) == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {id} still owns slots");
}

async fn bound_pid(scheduler: &Scheduler, id: JobId) -> Pid {
    scheduler.fleet().await.nodes[0]
        .resources
        .iter()
        .find(|r| r.job == Some(id))
        .and_then(|r| r.pid)
        .expect("job has no bound pid")
}

#[tokio::test]
async fn test_local_job_lifecycle() {
    let Setup { scheduler, dir } = setup();
    let request = r#"[{"count": 1, "process": [{"name": "gpu", "count": 2}]}]"#;

    let id = scheduler
        .submit(request, BuildRef::new("file:///dev/null", "HEAD"), None, &requester())
        .await
        .unwrap();
    wait_for_state(&scheduler, id, JobState::Waiting).await;

    scheduler.tick().await;
    assert_eq!(scheduler.job(id).await.unwrap().state, JobState::Running);

    let job_dir = dir.path().join("jobs").join(id.to_string());
    let devices = std::fs::read_to_string(job_dir.join("devices-0")).unwrap();
    assert_eq!(devices.trim(), "0,1");

    // Still alive on the next cycle.
    scheduler.tick().await;
    assert_eq!(scheduler.job(id).await.unwrap().state, JobState::Running);

    let pid = bound_pid(&scheduler, id).await;
    let status = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());

    tick_until_released(&scheduler, id).await;
    assert_eq!(scheduler.job(id).await.unwrap().state, JobState::Done);
}

#[tokio::test]
async fn test_deleted_job_is_killed() {
    let Setup { scheduler, dir: _dir } = setup();
    let request = r#"[{"count": 2, "process": [{"name": "gpu", "count": 1}]}]"#;

    let id = scheduler
        .submit(request, BuildRef::new("file:///dev/null", "HEAD"), None, &requester())
        .await
        .unwrap();
    wait_for_state(&scheduler, id, JobState::Waiting).await;
    scheduler.tick().await;
    assert_eq!(scheduler.fleet().await.owned_by(id), 2);

    scheduler.delete(id, &requester()).await.unwrap();
    tick_until_released(&scheduler, id).await;
    assert!(scheduler.job(id).await.is_none());
}

#[tokio::test]
async fn test_failed_prepare_reports_stderr() {
    let Setup { scheduler, dir } = setup();
    std::fs::write(
        dir.path().join("scripts").join("prepare.sh"),
        "echo 'fatal: unable to access origin' >&2\nexit 128\n",
    )
    .unwrap();
    let request = r#"[{"count": 1, "process": [{"name": "gpu", "count": 1}]}]"#;

    let id = scheduler
        .submit(request, BuildRef::new("https://invalid.example", "abc"), None, &requester())
        .await
        .unwrap();
    wait_for_state(&scheduler, id, JobState::Failed).await;

    let result = scheduler.job(id).await.unwrap().result.unwrap();
    assert!(result.contains("unable to access origin"));
}
