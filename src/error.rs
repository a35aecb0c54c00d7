//! Error types for k3box

use std::fmt;
use thiserror::Error;

/// Result type for k3box operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// A single node (or cluster-level step) that failed inside a bulk operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    /// Cluster the node belongs to
    pub cluster: String,
    /// Node name, or the cluster name for cluster-level steps
    pub node: String,
    /// Rendered error
    pub error: String,
}

impl NodeFailure {
    pub fn new(cluster: &str, node: &str, error: impl fmt::Display) -> Self {
        Self {
            cluster: cluster.to_string(),
            node: node.to_string(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.cluster, self.node, self.error)
    }
}

fn render_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// k3box error types
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid cluster name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Malformed port specification '{spec}': {reason}")]
    MalformedSpec { spec: String, reason: String },

    #[error("Invalid port binding '{spec}': {reason}")]
    InvalidPortBinding { spec: String, reason: String },

    #[error("Conflicting flags: {0}")]
    ConflictingFlags(String),

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Cluster already exists: {0}")]
    ClusterExists(String),

    #[error("Cluster {cluster} has {count} server containers")]
    AmbiguousServer { cluster: String, count: usize },

    #[error("{operation} finished with {} failure(s): {}", .failures.len(), render_failures(.failures))]
    PartialFailure {
        operation: String,
        failures: Vec<NodeFailure>,
    },

    #[error(
        "Rollback of cluster {cluster} failed after: {cause}; manual cleanup needed for: {}",
        render_failures(.leftovers)
    )]
    RollbackFailure {
        cluster: String,
        cause: Box<ClusterError>,
        leftovers: Vec<NodeFailure>,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ClusterError {
    pub(crate) fn malformed(spec: &str, reason: impl Into<String>) -> Self {
        ClusterError::MalformedSpec {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_binding(spec: &str, reason: impl Into<String>) -> Self {
        ClusterError::InvalidPortBinding {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors raised before the engine is touched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ClusterError::InvalidName { .. }
                | ClusterError::MalformedSpec { .. }
                | ClusterError::InvalidPortBinding { .. }
                | ClusterError::ConflictingFlags(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_classification() {
        assert!(ClusterError::malformed("80@nope", "unknown selector").is_validation());
        assert!(ClusterError::ConflictingFlags("x".into()).is_validation());
        assert!(!ClusterError::ClusterNotFound("t1".into()).is_validation());
        assert!(!ClusterError::Timeout("t1".into()).is_validation());
    }

    #[test]
    fn test_partial_failure_lists_every_node() {
        let err = ClusterError::PartialFailure {
            operation: "stop".to_string(),
            failures: vec![
                NodeFailure::new("t1", "k3box-t1-worker-0", "gone"),
                NodeFailure::new("t2", "k3box-t2-server", "busy"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("2 failure(s)"));
        assert!(text.contains("[t1/k3box-t1-worker-0] gone"));
        assert!(text.contains("[t2/k3box-t2-server] busy"));
    }

    #[test]
    fn test_rollback_failure_names_cause() {
        let err = ClusterError::RollbackFailure {
            cluster: "t1".to_string(),
            cause: Box::new(ClusterError::Timeout("wait".into())),
            leftovers: vec![NodeFailure::new("t1", "network", "in use")],
        };
        let text = err.to_string();
        assert!(text.contains("Timeout: wait"));
        assert!(text.contains("manual cleanup"));
    }
}
