//! Structured cluster requests.
//!
//! Turning the user's request text into a [`ClusterRequest`] is owned by an
//! external parser; [`JsonRequestParser`] accepts the structured form
//! directly:
//!
//! ```json
//! [{"count": 2, "process": [{"name": "gpu", "count": 2}, {"name": "cpu", "count": 1}]}]
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a cluster request.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed cluster request: {0}")]
    Malformed(String),

    #[error("cluster request is empty")]
    Empty,

    #[error("process group {group} has a zero count")]
    ZeroReplicas { group: usize },

    #[error("process group {group} requests no resources")]
    EmptyTemplate { group: usize },

    #[error("requirement '{name}' in process group {group} has a zero count")]
    ZeroResources { group: usize, name: String },
}

/// `count` slots of the resource called `name` (or one of its aliases).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub name: String,
    pub count: u32,
}

impl ResourceRequirement {
    pub fn new(name: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

/// `count` replicas of a process needing `process` on a single node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub count: u32,
    pub process: Vec<ResourceRequirement>,
}

impl ProcessRequest {
    pub fn new(count: u32, process: Vec<ResourceRequirement>) -> Self {
        Self { count, process }
    }
}

/// Ordered process groups of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterRequest(pub Vec<ProcessRequest>);

impl ClusterRequest {
    pub fn new(groups: Vec<ProcessRequest>) -> Self {
        Self(groups)
    }

    pub fn groups(&self) -> &[ProcessRequest] {
        &self.0
    }

    /// Total number of process instances across all groups.
    pub fn instance_count(&self) -> usize {
        self.0.iter().map(|g| g.count as usize).sum()
    }

    /// Reject requests that could never describe a runnable job.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.0.is_empty() {
            return Err(ParseError::Empty);
        }
        for (group, request) in self.0.iter().enumerate() {
            if request.count == 0 {
                return Err(ParseError::ZeroReplicas { group });
            }
            if request.process.is_empty() {
                return Err(ParseError::EmptyTemplate { group });
            }
            if let Some(r) = request.process.iter().find(|r| r.count == 0) {
                return Err(ParseError::ZeroResources {
                    group,
                    name: r.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Parser for the user-facing cluster request text.
pub trait RequestParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<ClusterRequest, ParseError>;
}

/// Parser accepting the JSON encoding of [`ClusterRequest`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRequestParser;

impl RequestParser for JsonRequestParser {
    fn parse(&self, text: &str) -> Result<ClusterRequest, ParseError> {
        let request: ClusterRequest =
            serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_request() {
        let text = r#"[{"count": 2, "process": [{"name": "gpu", "count": 2}, {"name": "cpu", "count": 1}]}]"#;
        let request = JsonRequestParser.parse(text).unwrap();
        assert_eq!(request.groups().len(), 1);
        assert_eq!(request.instance_count(), 2);
        assert_eq!(request.groups()[0].process[1], ResourceRequirement::new("cpu", 1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            JsonRequestParser.parse("2:[gpu"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(JsonRequestParser.parse("[]"), Err(ParseError::Empty)));
    }

    #[test]
    fn test_parse_rejects_zero_counts() {
        assert!(matches!(
            JsonRequestParser.parse(r#"[{"count": 0, "process": [{"name": "gpu", "count": 1}]}]"#),
            Err(ParseError::ZeroReplicas { group: 0 })
        ));
        assert!(matches!(
            JsonRequestParser.parse(r#"[{"count": 1, "process": [{"name": "gpu", "count": 0}]}]"#),
            Err(ParseError::ZeroResources { .. })
        ));
        assert!(matches!(
            JsonRequestParser.parse(r#"[{"count": 1, "process": []}]"#),
            Err(ParseError::EmptyTemplate { group: 0 })
        ));
    }
}
