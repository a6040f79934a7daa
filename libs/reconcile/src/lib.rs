//! Reconciliation loop primitives.
//!
//! This library holds the pieces of the reconciliation loop that do not
//! depend on scheduler state. Key concepts:
//!
//! - **Expected state**: the pids the scheduler has bound onto resource slots.
//! - **Observed state**: the pids a node reports as alive.
//! - **Report protocol**: node scripts print one `pid:<integer>` line per
//!   process; everything else on stdout is ignored.
//!
//! # Invariants
//!
//! - Parsing never fails loudly; unparsable lines are skipped
//! - A node that cannot be queried is observed as having no live processes
//! - Classification is deterministic given the same report

use std::collections::BTreeSet;
use std::time::Duration;

use pit_id::Pid;

/// Key of a process line in script output.
pub const PID_KEY: &str = "pid";

/// Default delay between two reconciliation cycles.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound for a single remote script call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse a single `pid:<integer>` line.
///
/// The line is split at its first colon; the key must be `pid` and the
/// remainder must be a non-zero integer. Surrounding whitespace is ignored.
pub fn parse_pid_line(line: &str) -> Option<Pid> {
    let (key, value) = line.split_once(':')?;
    if key.trim() != PID_KEY {
        return None;
    }
    value.trim().parse().ok()
}

/// Return the first pid announced in a script's stdout.
pub fn first_pid(stdout: &str) -> Option<Pid> {
    stdout.lines().find_map(parse_pid_line)
}

/// Collect every pid announced in a script's stdout.
pub fn pid_set(stdout: &str) -> BTreeSet<Pid> {
    stdout.lines().filter_map(parse_pid_line).collect()
}

/// Format a pid the way node scripts announce it.
pub fn format_pid_line(pid: Pid) -> String {
    format!("{PID_KEY}:{pid}")
}

/// What a node told us about its processes during the poll step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeReport {
    /// The query succeeded; these pids are alive.
    Live(BTreeSet<Pid>),

    /// The query failed or timed out.
    Unavailable,
}

impl NodeReport {
    /// Build a report from a finished `pids` call.
    pub fn from_output(exit_code: i32, stdout: &str) -> Self {
        if exit_code == 0 {
            Self::Live(pid_set(stdout))
        } else {
            Self::Unavailable
        }
    }

    /// Classify a bound pid against this report.
    pub fn observe(&self, pid: Pid) -> ProcessObservation {
        match self {
            Self::Live(pids) if pids.contains(&pid) => ProcessObservation::Alive,
            _ => ProcessObservation::Missing,
        }
    }

    /// Number of live pids reported.
    pub fn live_count(&self) -> usize {
        match self {
            Self::Live(pids) => pids.len(),
            Self::Unavailable => 0,
        }
    }

    /// Returns true if the node could not be queried.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Observation of a single expected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessObservation {
    /// The node reports the process as running.
    Alive,

    /// The node does not report the process (crashed, finished or unreachable).
    Missing,
}

impl ProcessObservation {
    /// Returns true if the process is still running.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Alive)
    }
}
