//! Node and resource registry.
//!
//! The registry is maintained outside the scheduler: node membership, slot
//! layout and the node state classification are read from a fleet file and
//! only the per-slot `job`/`pid` bindings are mutated here.
//!
//! Slot order inside a node is significant. A slot is identified by
//! `(node id, slot index)` and reservations refer to slots by index.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use pit_id::{JobId, NodeId, Pid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hardware type of accelerator slots exposed through `CUDA_VISIBLE_DEVICES`.
pub const CUDA_TYPE: &str = "cuda";

/// Errors from loading the fleet description.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read fleet file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid fleet JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid fleet: {0}")]
    Invalid(String),
}

/// Node state classification, ordered from least to most reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unknown,
    Offline,
    Online,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Offline => "offline",
            Self::Online => "online",
        }
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One allocatable slot on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Logical name matched against requirements (e.g. `gpu`, `cpu`).
    pub name: String,

    /// Hardware type, e.g. `cuda`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Hardware index within its type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    /// Owning job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobId>,

    /// Process bound to this slot. Only set together with `job`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
}

impl Resource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            index: None,
            job: None,
            pid: None,
        }
    }

    /// Attach a hardware type and index.
    pub fn with_hardware(mut self, kind: impl Into<String>, index: u32) -> Self {
        self.kind = Some(kind.into());
        self.index = Some(index);
        self
    }

    pub fn is_free(&self) -> bool {
        self.job.is_none()
    }

    /// Accelerator index to expose to the process, if this is a CUDA slot.
    pub fn cuda_index(&self) -> Option<u32> {
        match self.kind.as_deref() {
            Some(CUDA_TYPE) => self.index,
            _ => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.job = None;
        self.pid = None;
    }
}

/// A fleet member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    #[serde(default)]
    pub state: NodeState,

    /// SSH address. Nodes without an address run scripts on the local host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Account job processes run under on this node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Node {
    pub fn new(id: NodeId, state: NodeState) -> Self {
        Self {
            id,
            state,
            address: None,
            user: None,
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self
    }

    /// Number of slots currently owned by `job` on this node.
    pub fn owned_by(&self, job: JobId) -> usize {
        self.resources.iter().filter(|r| r.job == Some(job)).count()
    }
}

/// The whole fleet plus resource aliases, in registry order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fleet {
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Alias name -> canonical resource name.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Fleet {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            aliases: BTreeMap::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>, name: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), name.into());
        self
    }

    /// Load and validate a fleet description from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path)?;
        let fleet: Fleet = serde_json::from_str(&content)?;
        fleet.validate()?;
        Ok(fleet)
    }

    /// Check structural invariants of an externally supplied fleet.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(RegistryError::Invalid(format!("duplicate node id {}", node.id)));
            }
            for (index, resource) in node.resources.iter().enumerate() {
                if resource.pid.is_some() && resource.job.is_none() {
                    return Err(RegistryError::Invalid(format!(
                        "slot {index} on node {} has a pid but no job",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resolve an alias to its canonical resource name.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    /// Total number of slots owned by `job` across the fleet.
    pub fn owned_by(&self, job: JobId) -> usize {
        self.nodes.iter().map(|n| n.owned_by(job)).sum()
    }
}
