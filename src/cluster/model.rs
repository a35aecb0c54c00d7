//! Cluster and node model as read back from the engine

use super::naming::NodeRole;
use crate::engine::{ContainerSummary, PortSummary};
use serde::{Serialize, Serializer};

/// Raw container state reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    /// Engine reported nothing
    Unknown,
    /// Any state this crate does not know by name
    Other(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            "" => ContainerState::Unknown,
            other => ContainerState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
            ContainerState::Other(raw) => raw,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContainerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Aggregate cluster status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterStatus {
    /// At least one worker disagrees with the server
    Unhealthy,
    /// Server and every worker exited
    Stopped,
    /// Every node shares the server's state
    Node(ContainerState),
}

impl ClusterStatus {
    pub fn is_running(&self) -> bool {
        *self == ClusterStatus::Node(ContainerState::Running)
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterStatus::Unhealthy => write!(f, "unhealthy"),
            ClusterStatus::Stopped => write!(f, "stopped"),
            ClusterStatus::Node(state) => write!(f, "{}", state),
        }
    }
}

impl Serialize for ClusterStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Classify a cluster from the raw state of its server and workers
pub fn cluster_status(server: &ContainerState, workers: &[ContainerState]) -> ClusterStatus {
    if workers.iter().any(|w| w != server) {
        return ClusterStatus::Unhealthy;
    }
    match server {
        ContainerState::Exited => ClusterStatus::Stopped,
        other => ClusterStatus::Node(other.clone()),
    }
}

/// One node container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Engine-assigned id
    pub id: String,
    pub name: String,
    pub role: NodeRole,
    /// Worker ordinal; `None` for the server
    pub ordinal: Option<u32>,
    pub state: ContainerState,
    pub ports: Vec<PortSummary>,
    /// Creation time, display only
    pub created: Option<i64>,
}

impl Node {
    pub fn from_summary(summary: &ContainerSummary, role: NodeRole, ordinal: Option<u32>) -> Self {
        Self {
            id: summary.id.clone(),
            name: summary.name().to_string(),
            role,
            ordinal,
            state: ContainerState::parse(&summary.state),
            ports: summary.ports.clone(),
            created: summary.created,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// A cluster assembled from its labelled containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub name: String,
    pub image: String,
    pub status: ClusterStatus,
    /// Host ports bound on the server
    pub server_ports: Vec<u16>,
    pub server: Node,
    /// Workers in ordinal order
    pub workers: Vec<Node>,
}

impl Cluster {
    pub fn running_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }

    /// `running/total` worker count
    pub fn worker_summary(&self) -> String {
        format!("{}/{}", self.running_workers(), self.workers.len())
    }

    /// Every node, server first
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::once(&self.server).chain(self.workers.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(raw: &[&str]) -> Vec<ContainerState> {
        raw.iter().map(|s| ContainerState::parse(s)).collect()
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("Exited"), ContainerState::Exited);
        assert_eq!(ContainerState::parse(""), ContainerState::Unknown);
        assert_eq!(
            ContainerState::parse("frozen"),
            ContainerState::Other("frozen".to_string())
        );
        assert_eq!(ContainerState::parse("frozen").to_string(), "frozen");
    }

    #[test]
    fn test_any_disagreeing_worker_is_unhealthy() {
        let server = ContainerState::Running;
        assert_eq!(
            cluster_status(&server, &states(&["running", "exited"])),
            ClusterStatus::Unhealthy
        );

        let server = ContainerState::Exited;
        assert_eq!(
            cluster_status(&server, &states(&["exited", "running"])),
            ClusterStatus::Unhealthy
        );
    }

    #[test]
    fn test_all_exited_is_stopped() {
        assert_eq!(
            cluster_status(&ContainerState::Exited, &states(&["exited", "exited"])),
            ClusterStatus::Stopped
        );
        assert_eq!(cluster_status(&ContainerState::Exited, &[]), ClusterStatus::Stopped);
    }

    #[test]
    fn test_agreeing_state_passes_through() {
        let status = cluster_status(&ContainerState::Running, &states(&["running"]));
        assert!(status.is_running());
        assert_eq!(status.to_string(), "running");

        let status = cluster_status(&ContainerState::Created, &[]);
        assert_eq!(status.to_string(), "created");
    }

    #[test]
    fn test_status_serializes_as_string() {
        let json = serde_json::to_string(&ClusterStatus::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
        let json = serde_json::to_string(&ContainerState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
