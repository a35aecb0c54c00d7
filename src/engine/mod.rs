//! Container engine seam
//!
//! The controller only ever talks to the engine through [`ContainerEngine`].
//! Labels stamped on containers and networks are the only record of which
//! clusters exist; every query goes back to the engine.

pub mod docker;
pub mod memory;

use crate::error::Result;
use crate::port::PublishedPortSet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub use docker::DockerEngine;
pub use memory::MemoryEngine;

/// Label carrying the identity value of this tool
pub const LABEL_APP: &str = "app";
/// Label carrying the node role (`server` or `worker`)
pub const LABEL_COMPONENT: &str = "component";
/// Label carrying the cluster name
pub const LABEL_CLUSTER: &str = "cluster";
/// Label carrying the creation timestamp of a container
pub const LABEL_CREATED: &str = "created";

/// Label equality filter; every pair must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    labels: BTreeMap<String, String>,
}

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `key=value` requirement
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// True when `labels` carries every required pair
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).map(|l| l == v).unwrap_or(false))
    }

    /// `key=value` strings, as the engine's label filter expects them
    pub fn to_pairs(&self) -> Vec<String> {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Network to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Network as listed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

/// Container to create
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Hostname inside the container
    pub hostname: String,
    /// Image reference
    pub image: String,
    /// Command arguments
    pub cmd: Vec<String>,
    /// `KEY=value` environment entries
    pub env: Vec<String>,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Exposed ports and host bindings
    pub ports: PublishedPortSet,
    /// Bind mounts in `source:target[:mode]` form
    pub binds: Vec<String>,
    /// Paths mounted as tmpfs
    pub tmpfs: Vec<String>,
    /// Run privileged
    pub privileged: bool,
    /// Network to attach to
    pub network: String,
    /// Aliases on that network
    pub aliases: Vec<String>,
}

/// Published port as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSummary {
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub protocol: Option<String>,
}

/// Container as listed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    /// Raw engine state (`created`, `running`, `exited`, ...)
    pub state: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortSummary>,
    /// Unix timestamp
    pub created: Option<i64>,
}

impl ContainerSummary {
    /// First name without the engine's leading `/`
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or(&self.id)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Primitives the cluster controller needs from a container engine
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// API version reported by the engine
    async fn version(&self) -> Result<String>;

    /// Create a network, returning its id
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    /// List networks matching every label in `filter`
    async fn list_networks(&self, filter: &LabelFilter) -> Result<Vec<NetworkSummary>>;

    /// Remove a network by id
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Pull an image; progress goes to stdout only when `verbose`
    async fn pull_image(&self, image: &str, verbose: bool) -> Result<()>;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Force-remove a container together with its anonymous volumes
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// List containers matching every label in `filter`; stopped ones only
    /// when `all`
    async fn list_containers(&self, filter: &LabelFilter, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Combined stdout/stderr of a container
    async fn container_logs(&self, id: &str) -> Result<String>;

    /// Copy one file out of a container as a tar archive stream
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_filter_is_conjunctive() {
        let filter = LabelFilter::new()
            .with(LABEL_APP, "k3box")
            .with(LABEL_COMPONENT, "server");

        let mut labels = HashMap::new();
        labels.insert(LABEL_APP.to_string(), "k3box".to_string());
        assert!(!filter.matches(&labels));

        labels.insert(LABEL_COMPONENT.to_string(), "server".to_string());
        labels.insert(LABEL_CLUSTER.to_string(), "t1".to_string());
        assert!(filter.matches(&labels));

        labels.insert(LABEL_COMPONENT.to_string(), "worker".to_string());
        assert!(!filter.matches(&labels));
    }

    #[test]
    fn test_label_filter_pairs() {
        let filter = LabelFilter::new().with(LABEL_CLUSTER, "t1").with(LABEL_APP, "k3box");
        assert_eq!(filter.to_pairs(), vec!["app=k3box", "cluster=t1"]);
    }

    #[test]
    fn test_summary_name_strips_slash() {
        let summary = ContainerSummary {
            id: "abc".to_string(),
            names: vec!["/k3box-t1-server".to_string()],
            image: String::new(),
            state: "running".to_string(),
            labels: HashMap::new(),
            ports: Vec::new(),
            created: None,
        };
        assert_eq!(summary.name(), "k3box-t1-server");
    }
}
