//! SQLite-based state store for the scheduler.
//!
//! Holds everything the fleet file does not: job records, the admission
//! queue, the id counter and the per-slot job/pid bindings. The store is
//! rewritten as a whole after each mutation so a restarted control plane
//! resumes from the last completed step.

use std::path::Path;

use pit_id::{JobId, NodeId, Pid};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use crate::job::{Job, JobBook, JobState};
use crate::registry::Fleet;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// A slot binding as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBinding {
    pub node: NodeId,
    pub slot: usize,
    pub job: JobId,
    pub pid: Option<Pid>,
}

/// Scheduler state read back from the store.
#[derive(Debug, Clone)]
pub struct PersistedState {
    pub jobs: JobBook,
    pub bindings: Vec<SlotBinding>,
}

impl PersistedState {
    /// Re-apply persisted bindings onto a freshly loaded fleet.
    ///
    /// Bindings whose node or slot no longer exists are dropped.
    pub fn apply_bindings(&self, fleet: &mut Fleet) {
        for binding in &self.bindings {
            let slot = fleet
                .node_mut(&binding.node)
                .and_then(|node| node.resources.get_mut(binding.slot));
            match slot {
                Some(slot) => {
                    slot.job = Some(binding.job);
                    slot.pid = binding.pid;
                }
                None => warn!(
                    node_id = %binding.node,
                    slot = binding.slot,
                    job_id = %binding.job,
                    "Dropping binding for a slot missing from the fleet"
                ),
            }
        }
    }
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scheduler_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                next_job_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                job_id INTEGER PRIMARY KEY,
                state TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS schedule (
                position INTEGER PRIMARY KEY,
                job_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bindings (
                node_id TEXT NOT NULL,
                slot INTEGER NOT NULL,
                job_id INTEGER NOT NULL,
                pid INTEGER,
                PRIMARY KEY (node_id, slot)
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    /// Replace the stored state with the given job book and fleet bindings.
    pub fn save(&self, jobs: &JobBook, fleet: &Fleet) -> Result<(), StateStoreError> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO scheduler_meta (id, next_job_id) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET next_job_id = excluded.next_job_id",
            params![jobs.next_id().value() as i64],
        )?;

        tx.execute("DELETE FROM jobs", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO jobs (job_id, state, body) VALUES (?1, ?2, ?3)")?;
            for job in jobs.jobs() {
                let body = serde_json::to_string(job)?;
                stmt.execute(params![job.id.value() as i64, job.state.as_str(), body])?;
            }
        }

        tx.execute("DELETE FROM schedule", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO schedule (position, job_id) VALUES (?1, ?2)")?;
            for (position, id) in jobs.schedule().enumerate() {
                stmt.execute(params![position as i64, id.value() as i64])?;
            }
        }

        tx.execute("DELETE FROM bindings", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO bindings (node_id, slot, job_id, pid) VALUES (?1, ?2, ?3, ?4)")?;
            for node in &fleet.nodes {
                for (slot, resource) in node.resources.iter().enumerate() {
                    if let Some(job) = resource.job {
                        stmt.execute(params![
                            node.id.as_str(),
                            slot as i64,
                            job.value() as i64,
                            resource.pid.map(|p| p.value() as i64),
                        ])?;
                    }
                }
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the stored state, or `None` if nothing was ever saved.
    pub fn load(&self) -> Result<Option<PersistedState>, StateStoreError> {
        let next_id: Option<i64> = self
            .conn
            .query_row("SELECT next_job_id FROM scheduler_meta WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        let Some(next_id) = next_id else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare("SELECT job_id, state, body FROM jobs ORDER BY job_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (id, state, body) in rows {
            let mut job: Job = serde_json::from_str(&body)?;
            if job.id.value() as i64 != id {
                return Err(StateStoreError::Invalid(format!(
                    "job row {id} holds record for job {}",
                    job.id
                )));
            }
            job.state = JobState::from_str(&state)
                .ok_or_else(|| StateStoreError::Invalid(format!("unknown job state '{state}'")))?;
            jobs.push(job);
        }

        let mut stmt = self.conn.prepare("SELECT job_id FROM schedule ORDER BY position")?;
        let schedule = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(job_id)
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self
            .conn
            .prepare("SELECT node_id, slot, job_id, pid FROM bindings ORDER BY node_id, slot")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut bindings = Vec::with_capacity(rows.len());
        for (node, slot, job, pid) in rows {
            let node: NodeId = node
                .parse()
                .map_err(|e| StateStoreError::Invalid(format!("binding node id: {e}")))?;
            let pid = match pid {
                Some(pid) => Some(
                    u32::try_from(pid)
                        .ok()
                        .filter(|p| *p != 0)
                        .map(Pid::new)
                        .ok_or_else(|| StateStoreError::Invalid(format!("invalid pid {pid}")))?,
                ),
                None => None,
            };
            bindings.push(SlotBinding {
                node,
                slot: usize::try_from(slot)
                    .map_err(|_| StateStoreError::Invalid(format!("invalid slot {slot}")))?,
                job: job_id(job)?,
                pid,
            });
        }

        Ok(Some(PersistedState {
            jobs: JobBook::from_parts(job_id(next_id)?, jobs, schedule),
            bindings,
        }))
    }
}

fn job_id(raw: i64) -> Result<JobId, StateStoreError> {
    u64::try_from(raw)
        .ok()
        .filter(|id| *id != 0)
        .map(JobId::new)
        .ok_or_else(|| StateStoreError::Invalid(format!("invalid job id {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::BuildRef;
    use crate::registry::{Node, NodeState, Resource};
    use crate::request::{ClusterRequest, ProcessRequest, ResourceRequirement};

    fn book() -> JobBook {
        let mut book = JobBook::new();
        for _ in 0..2 {
            let id = book.allocate_id();
            book.insert(Job::new(
                id,
                "alice".parse().unwrap(),
                BuildRef::new("https://example.com/repo.git", "abc123").with_diff("diff --git"),
                Some("training run".to_string()),
                ClusterRequest::new(vec![ProcessRequest::new(1, vec![ResourceRequirement::new("gpu", 1)])]),
            ));
            book.transition(id, JobState::Waiting);
            book.enqueue(id);
        }
        book
    }

    fn fleet() -> Fleet {
        Fleet::new(vec![Node::new("n1".parse().unwrap(), NodeState::Online)
            .with_resource(Resource::new("gpu"))
            .with_resource(Resource::new("gpu"))])
    }

    #[test]
    fn test_empty_store_loads_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let store = StateStore::open_in_memory().unwrap();
        let book = book();
        let mut fleet = fleet();
        fleet.nodes[0].resources[1].job = Some(JobId::new(1));
        fleet.nodes[0].resources[1].pid = Some(Pid::new(4242));

        store.save(&book, &fleet).unwrap();
        let persisted = store.load().unwrap().unwrap();

        assert_eq!(persisted.jobs.len(), 2);
        assert_eq!(persisted.jobs.next_id(), book.next_id());
        assert_eq!(
            persisted.jobs.schedule().collect::<Vec<_>>(),
            book.schedule().collect::<Vec<_>>()
        );
        let job = persisted.jobs.get(JobId::new(1)).unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.build.diff, "diff --git");
        assert_eq!(
            persisted.bindings,
            vec![SlotBinding {
                node: "n1".parse().unwrap(),
                slot: 1,
                job: JobId::new(1),
                pid: Some(Pid::new(4242)),
            }]
        );

        let mut restored = self::fleet();
        persisted.apply_bindings(&mut restored);
        assert_eq!(restored, fleet);
    }

    #[test]
    fn test_save_replaces_previous_state() {
        let store = StateStore::open_in_memory().unwrap();
        let mut book = book();
        store.save(&book, &fleet()).unwrap();

        book.remove(JobId::new(1));
        store.save(&book, &fleet()).unwrap();

        let persisted = store.load().unwrap().unwrap();
        assert_eq!(persisted.jobs.len(), 1);
        assert_eq!(persisted.jobs.head(), Some(JobId::new(2)));
        assert!(persisted.bindings.is_empty());
    }

    #[test]
    fn test_bindings_for_unknown_slots_are_dropped() {
        let persisted = PersistedState {
            jobs: JobBook::new(),
            bindings: vec![SlotBinding {
                node: "gone".parse().unwrap(),
                slot: 0,
                job: JobId::new(3),
                pid: None,
            }],
        };
        let mut fleet = fleet();
        persisted.apply_bindings(&mut fleet);
        assert_eq!(fleet, self::fleet());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = StateStore::open(&path).unwrap();
            store.save(&book(), &fleet()).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.load().unwrap().unwrap().jobs.len(), 2);
    }
}
