//! Remote execution gateway.
//!
//! The gateway runs one of four named scripts either on the control-plane
//! host or on a fleet node and hands back exit code, stdout and stderr.
//! Failures never surface as errors: a script that cannot be read, a
//! transport that cannot connect and a call that exceeds its deadline all
//! come back as a non-zero [`ScriptOutput`].
//!
//! A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use pit_id::{NodeId, Pid};
use pit_reconcile::format_pid_line;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::registry::Node;

/// Exit code reported for calls that never produced one (spawn failure, timeout).
pub const NO_EXIT_CODE: i32 = -1;

/// Environment passed to a script, exported before the script body runs.
pub type ScriptEnv = BTreeMap<String, String>;

/// The scripts a node understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Script {
    /// Check out a job's build into its working directory.
    Prepare,
    /// Launch one process instance and print `pid:<n>`.
    Run,
    /// List live processes of an account as `pid:<n>` lines.
    Pids,
    /// Terminate a process.
    Kill,
}

impl Script {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Run => "run",
            Self::Pids => "pids",
            Self::Kill => "kill",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.sh", self.as_str())
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a script runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The control-plane host.
    Local,
    /// A fleet node.
    Node(NodeTarget),
}

/// Connection details of a node, detached from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTarget {
    pub id: NodeId,
    pub address: Option<String>,
    pub user: Option<String>,
}

impl From<&Node> for NodeTarget {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            address: node.address.clone(),
            user: node.user.clone(),
        }
    }
}

impl Target {
    pub fn node(node: &Node) -> Self {
        Self::Node(NodeTarget::from(node))
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Local => None,
            Self::Node(node) => Some(&node.id),
        }
    }
}

/// Result of a script call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Remote execution interface.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Run `script` on `target` with `env` exported.
    async fn run_script(&self, target: &Target, script: Script, env: ScriptEnv) -> ScriptOutput;
}

/// Gateway handle that bounds every call by a deadline.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<dyn Gateway>,
    timeout: Duration,
}

impl GatewayClient {
    pub fn new(inner: Arc<dyn Gateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Run a script; a call exceeding the deadline reports [`NO_EXIT_CODE`].
    pub async fn call(&self, target: &Target, script: Script, env: ScriptEnv) -> ScriptOutput {
        match tokio::time::timeout(self.timeout, self.inner.run_script(target, script, env)).await {
            Ok(output) => {
                if !output.is_success() {
                    warn!(
                        node_id = ?target.node_id().map(|n| n.as_str()),
                        %script,
                        exit_code = output.exit_code,
                        stderr = %output.stderr.trim(),
                        "Script failed"
                    );
                }
                output
            }
            Err(_) => {
                warn!(
                    node_id = ?target.node_id().map(|n| n.as_str()),
                    %script,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Script timed out"
                );
                ScriptOutput::failure(
                    NO_EXIT_CODE,
                    format!("{script} timed out after {:?}", self.timeout),
                )
            }
        }
    }
}

// =============================================================================
// Shell transport
// =============================================================================

/// Gateway piping script files into `bash -s`, locally or over `ssh`.
pub struct ScriptGateway {
    scripts_dir: PathBuf,
}

impl ScriptGateway {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    fn command(target: &Target) -> Command {
        match target {
            Target::Node(NodeTarget {
                address: Some(address),
                user,
                ..
            }) => {
                let destination = match user {
                    Some(user) => format!("{user}@{address}"),
                    None => address.clone(),
                };
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]).arg(destination).args(["bash", "-s"]);
                cmd
            }
            _ => {
                let mut cmd = Command::new("bash");
                cmd.arg("-s");
                cmd
            }
        }
    }
}

#[async_trait]
impl Gateway for ScriptGateway {
    async fn run_script(&self, target: &Target, script: Script, env: ScriptEnv) -> ScriptOutput {
        let path = self.scripts_dir.join(script.file_name());
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(body) => body,
            Err(e) => {
                return ScriptOutput::failure(
                    1,
                    format!("Problem reading script \"{}\": {e}", path.display()),
                )
            }
        };

        let mut input = String::new();
        for (name, value) in &env {
            input.push_str(&format!("export {name}={}\n", quote(value)));
        }
        input.push_str(&body);
        input.push('\n');

        debug!(node_id = ?target.node_id().map(|n| n.as_str()), %script, "Running script");

        let mut child = match Self::command(target)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ScriptOutput::failure(NO_EXIT_CODE, format!("spawn failed: {e}")),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                return ScriptOutput::failure(NO_EXIT_CODE, format!("failed to write script: {e}"));
            }
        }

        match child.wait_with_output().await {
            Ok(output) => ScriptOutput {
                exit_code: output.status.code().unwrap_or(NO_EXIT_CODE),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => ScriptOutput::failure(NO_EXIT_CODE, format!("failed to wait for script: {e}")),
        }
    }
}

/// Quote a value as a bash ANSI-C string (`$'...'`).
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 3);
    out.push_str("$'");
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\\n");
            }
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Debug, Default)]
struct MockState {
    live: HashMap<NodeId, BTreeSet<Pid>>,
    unreachable: BTreeSet<NodeId>,
    failing_runs: BTreeSet<NodeId>,
    silent_runs: bool,
    fail_prepare: bool,
    runs: Vec<(NodeId, ScriptEnv)>,
    kills: Vec<(NodeId, Pid)>,
    calls: HashMap<Script, usize>,
}

/// In-memory gateway simulating nodes that run the scripts.
///
/// `run` hands out increasing pids and marks them alive, `pids` reports the
/// live set, `kill` removes a pid. `prepare` creates `$JOBS_DIR/$JOB_NAME`.
pub struct MockGateway {
    next_pid: AtomicU32,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::with_first_pid(1000)
    }

    pub fn with_first_pid(pid: u32) -> Self {
        Self {
            next_pid: AtomicU32::new(pid),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `prepare` fail with a diagnostic on stderr.
    pub fn fail_prepare(&self, fail: bool) {
        self.state().fail_prepare = fail;
    }

    /// Make `run` fail on `node`.
    pub fn fail_runs_on(&self, node: &NodeId, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_runs.insert(node.clone());
        } else {
            state.failing_runs.remove(node);
        }
    }

    /// Make `run` succeed without printing a pid line.
    pub fn silent_runs(&self, silent: bool) {
        self.state().silent_runs = silent;
    }

    /// Make every call to `node` fail as if the node were unreachable.
    pub fn set_unreachable(&self, node: &NodeId, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(node.clone());
        } else {
            state.unreachable.remove(node);
        }
    }

    /// Simulate a process exiting on its own.
    pub fn crash(&self, node: &NodeId, pid: Pid) {
        if let Some(live) = self.state().live.get_mut(node) {
            live.remove(&pid);
        }
    }

    /// Pretend a process is running on `node`.
    pub fn spawn_process(&self, node: &NodeId, pid: Pid) {
        self.state().live.entry(node.clone()).or_default().insert(pid);
    }

    pub fn live_pids(&self, node: &NodeId) -> BTreeSet<Pid> {
        self.state().live.get(node).cloned().unwrap_or_default()
    }

    /// Environments of every `run` call, in call order.
    pub fn runs(&self) -> Vec<(NodeId, ScriptEnv)> {
        self.state().runs.clone()
    }

    /// Every `kill` call, in call order.
    pub fn kills(&self) -> Vec<(NodeId, Pid)> {
        self.state().kills.clone()
    }

    pub fn calls(&self, script: Script) -> usize {
        self.state().calls.get(&script).copied().unwrap_or(0)
    }

    fn prepare(&self, env: &ScriptEnv) -> ScriptOutput {
        if self.state().fail_prepare {
            return ScriptOutput::failure(128, "fatal: repository not found");
        }
        let (Some(jobs_dir), Some(job)) = (env.get("JOBS_DIR"), env.get("JOB_NAME")) else {
            return ScriptOutput::failure(2, "JOBS_DIR and JOB_NAME are required");
        };
        match std::fs::create_dir_all(PathBuf::from(jobs_dir).join(job)) {
            Ok(()) => ScriptOutput::success("prepared\n"),
            Err(e) => ScriptOutput::failure(1, e.to_string()),
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn run_script(&self, target: &Target, script: Script, env: ScriptEnv) -> ScriptOutput {
        *self.state().calls.entry(script).or_default() += 1;

        let node = match target {
            Target::Local => {
                return match script {
                    Script::Prepare => self.prepare(&env),
                    _ => ScriptOutput::failure(1, format!("[MOCK] {script} needs a node")),
                };
            }
            Target::Node(node) => node.id.clone(),
        };

        if self.state().unreachable.contains(&node) {
            return ScriptOutput::failure(255, format!("ssh: connect to host {node}: No route to host"));
        }

        match script {
            Script::Prepare => self.prepare(&env),
            Script::Run => {
                let mut state = self.state();
                state.runs.push((node.clone(), env));
                if state.failing_runs.contains(&node) {
                    return ScriptOutput::failure(1, "[MOCK] run failed");
                }
                if state.silent_runs {
                    return ScriptOutput::success("started\n");
                }
                let pid = Pid::new(self.next_pid.fetch_add(1, Ordering::SeqCst));
                state.live.entry(node.clone()).or_default().insert(pid);
                info!(node_id = %node, %pid, "[MOCK] Process started");
                ScriptOutput::success(format!("starting\n{}\n", format_pid_line(pid)))
            }
            Script::Pids => {
                let state = self.state();
                let stdout: String = state
                    .live
                    .get(&node)
                    .into_iter()
                    .flatten()
                    .map(|pid| format!("{}\n", format_pid_line(*pid)))
                    .collect();
                ScriptOutput::success(stdout)
            }
            Script::Kill => {
                let Some(pid) = env.get("PID").and_then(|p| p.parse::<Pid>().ok()) else {
                    return ScriptOutput::failure(2, "PID is required");
                };
                let mut state = self.state();
                state.kills.push((node.clone(), pid));
                if let Some(live) = state.live.get_mut(&node) {
                    live.remove(&pid);
                }
                debug!(node_id = %node, %pid, "[MOCK] Process killed");
                ScriptOutput::success("")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pit_reconcile::{first_pid, pid_set};

    fn target(id: &str) -> Target {
        Target::Node(NodeTarget {
            id: id.parse().unwrap(),
            address: None,
            user: None,
        })
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "$'plain'");
        assert_eq!(quote("it's"), "$'it\\'s'");
        assert_eq!(quote("a\\b"), "$'a\\\\b'");
        assert_eq!(quote("l1\nl2\r\nl3"), "$'l1\\nl2\\nl3'");
    }

    #[test]
    fn test_script_file_names() {
        assert_eq!(Script::Prepare.file_name(), "prepare.sh");
        assert_eq!(Script::Kill.file_name(), "kill.sh");
    }

    #[tokio::test]
    async fn test_mock_run_then_kill() {
        let gateway = MockGateway::with_first_pid(4321);
        let n1 = target("n1");

        let run = gateway.run_script(&n1, Script::Run, ScriptEnv::new()).await;
        assert!(run.is_success());
        let pid = first_pid(&run.stdout).unwrap();
        assert_eq!(pid, Pid::new(4321));

        let pids = gateway.run_script(&n1, Script::Pids, ScriptEnv::new()).await;
        assert!(pid_set(&pids.stdout).contains(&pid));

        let mut env = ScriptEnv::new();
        env.insert("PID".to_string(), pid.to_string());
        gateway.run_script(&n1, Script::Kill, env).await;
        assert!(gateway.live_pids(&"n1".parse().unwrap()).is_empty());
        assert_eq!(gateway.calls(Script::Kill), 1);
    }

    #[tokio::test]
    async fn test_mock_unreachable_node() {
        let gateway = MockGateway::new();
        gateway.set_unreachable(&"n1".parse().unwrap(), true);
        let output = gateway.run_script(&target("n1"), Script::Pids, ScriptEnv::new()).await;
        assert_eq!(output.exit_code, 255);
    }

    struct HangingGateway;

    #[async_trait]
    impl Gateway for HangingGateway {
        async fn run_script(&self, _: &Target, _: Script, _: ScriptEnv) -> ScriptOutput {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_client_times_out() {
        let client = GatewayClient::new(Arc::new(HangingGateway), Duration::from_millis(20));
        let output = client.call(&target("n1"), Script::Pids, ScriptEnv::new()).await;
        assert_eq!(output.exit_code, NO_EXIT_CODE);
        assert!(output.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_script_gateway_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = ScriptGateway::new(dir.path());
        let output = gateway.run_script(&Target::Local, Script::Run, ScriptEnv::new()).await;
        assert_eq!(output.exit_code, 1);
        assert!(output.stderr.contains("Problem reading script"));
    }
}
