//! Job records, lifecycle states and the admission queue.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use pit_id::{JobId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::request::ClusterRequest;

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Prepared and queued for admission.
    Waiting,
    /// Build checkout in progress.
    Preparing,
    /// Processes are being launched.
    Starting,
    /// All processes launched.
    Running,
    /// At least one process is gone; the rest are being reclaimed.
    Stopping,
    /// Every owned resource has been released.
    Done,
    /// Preparation failed.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Preparing => "preparing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "preparing" => Some(Self::Preparing),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Preparing, Waiting)
                | (Preparing, Failed)
                | (Waiting, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Done)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source revision a job is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRef {
    pub origin: String,
    pub hash: String,
    #[serde(default)]
    pub diff: String,
}

impl BuildRef {
    pub fn new(origin: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            hash: hash.into(),
            diff: String::new(),
        }
    }

    pub fn with_diff(mut self, diff: impl Into<String>) -> Self {
        self.diff = diff.into();
        self
    }
}

/// A submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user: UserId,
    pub build: BuildRef,
    pub description: String,
    pub request: ClusterRequest,
    pub state: JobState,
    /// Diagnostic output of a failed preparation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a job in `Preparing`. An empty description is replaced by
    /// `"<user> - <timestamp>"`.
    pub fn new(
        id: JobId,
        user: UserId,
        build: BuildRef,
        description: Option<String>,
        request: ClusterRequest,
    ) -> Self {
        let created_at = Utc::now();
        let description = description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("{} - {}", user, created_at.to_rfc3339()));
        Self {
            id,
            user,
            build,
            description,
            request,
            state: JobState::Preparing,
            result: None,
            created_at,
        }
    }
}

/// All job records plus the admission queue and the id counter.
#[derive(Debug, Clone, Default)]
pub struct JobBook {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    schedule: VecDeque<JobId>,
}

impl JobBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a book from persisted parts.
    pub fn from_parts(next_id: JobId, jobs: Vec<Job>, schedule: Vec<JobId>) -> Self {
        let jobs: BTreeMap<JobId, Job> = jobs.into_iter().map(|j| (j.id, j)).collect();
        // Never hand out an id that is already taken, whatever the stored counter says.
        let floor = jobs.keys().next_back().map(JobId::next).unwrap_or(JobId::FIRST);
        Self {
            next_id: next_id.max(floor),
            jobs,
            schedule: schedule.into(),
        }
    }

    /// Allocate the next job id. Ids are never reused.
    pub fn allocate_id(&mut self) -> JobId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    pub fn next_id(&self) -> JobId {
        self.next_id
    }

    pub fn insert(&mut self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.jobs.get(&id).map(|j| j.state)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Remove a job record and its queue entry, if any.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id)?;
        self.schedule.retain(|queued| *queued != id);
        Some(job)
    }

    /// Move a job to `next` if the lifecycle allows it.
    ///
    /// Returns true if the job is in `next` afterwards.
    pub fn transition(&mut self, id: JobId, next: JobState) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if job.state == next {
            return true;
        }
        if !job.state.can_transition_to(next) {
            debug!(job_id = %id, from = %job.state, to = %next, "Ignoring invalid job transition");
            return false;
        }
        info!(job_id = %id, from = %job.state, to = %next, "Job state changed");
        job.state = next;
        true
    }

    pub fn enqueue(&mut self, id: JobId) {
        self.schedule.push_back(id);
    }

    pub fn head(&self) -> Option<JobId> {
        self.schedule.front().copied()
    }

    pub fn pop_head(&mut self) -> Option<JobId> {
        self.schedule.pop_front()
    }

    pub fn schedule(&self) -> impl Iterator<Item = JobId> + '_ {
        self.schedule.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(book: &mut JobBook) -> JobId {
        let id = book.allocate_id();
        book.insert(Job::new(
            id,
            "alice".parse().unwrap(),
            BuildRef::new("https://example.com/repo.git", "abc123"),
            None,
            ClusterRequest::default(),
        ));
        id
    }

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let mut book = JobBook::new();
        let a = job(&mut book);
        let b = job(&mut book);
        assert!(b > a);
        book.remove(b);
        let c = job(&mut book);
        assert!(c > b);
    }

    #[test]
    fn test_default_description() {
        let mut book = JobBook::new();
        let id = job(&mut book);
        assert!(book.get(id).unwrap().description.starts_with("alice - "));
    }

    #[test]
    fn test_remove_drops_queue_entry() {
        let mut book = JobBook::new();
        let a = job(&mut book);
        let b = job(&mut book);
        book.enqueue(a);
        book.enqueue(b);
        book.remove(a);
        assert_eq!(book.schedule().collect::<Vec<_>>(), vec![b]);
        assert_eq!(book.head(), Some(b));
    }

    #[test]
    fn test_transitions_follow_lifecycle() {
        let mut book = JobBook::new();
        let id = job(&mut book);
        assert!(!book.transition(id, JobState::Running));
        assert!(book.transition(id, JobState::Waiting));
        assert!(book.transition(id, JobState::Starting));
        assert!(book.transition(id, JobState::Running));
        assert!(book.transition(id, JobState::Stopping));
        assert!(book.transition(id, JobState::Stopping));
        assert!(book.transition(id, JobState::Done));
        assert!(!book.transition(id, JobState::Stopping));
        assert_eq!(book.state(id), Some(JobState::Done));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Stopping.is_terminal());
    }

    #[test]
    fn test_from_parts_keeps_counter_ahead_of_ids() {
        let mut book = JobBook::new();
        let id = job(&mut book);
        let jobs: Vec<Job> = book.jobs().cloned().collect();
        let restored = JobBook::from_parts(JobId::FIRST, jobs, vec![id]);
        assert_eq!(restored.next_id(), id.next());
        assert_eq!(restored.head(), Some(id));
    }
}
