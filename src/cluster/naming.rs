//! Node naming
//!
//! Every node container is addressed by a name derived from the cluster name
//! and its slot: `<prefix>-<cluster>-server` for the server and
//! `<prefix>-<cluster>-worker-<ordinal>` for workers. The same string is used
//! as container name, hostname and network alias.

use crate::error::{ClusterError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Longest accepted cluster name, so node names stay below the 63 character
/// host name limit
pub const CLUSTER_NAME_MAX_LEN: usize = 35;

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Control-plane node
    Server,
    /// Agent node
    Worker,
}

impl NodeRole {
    /// Value of the `component` label
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Server => "server",
            NodeRole::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a node inside its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeSlot {
    /// The single server
    Server,
    /// Worker with a zero-based ordinal
    Worker(u32),
}

impl NodeSlot {
    pub fn role(&self) -> NodeRole {
        match self {
            NodeSlot::Server => NodeRole::Server,
            NodeSlot::Worker(_) => NodeRole::Worker,
        }
    }

    pub fn ordinal(&self) -> Option<u32> {
        match self {
            NodeSlot::Server => None,
            NodeSlot::Worker(i) => Some(*i),
        }
    }
}

/// Build the node name for a slot of a cluster
pub fn node_name(prefix: &str, cluster: &str, slot: NodeSlot) -> String {
    match slot {
        NodeSlot::Server => format!("{}-{}-server", prefix, cluster),
        NodeSlot::Worker(i) => format!("{}-{}-worker-{}", prefix, cluster, i),
    }
}

/// Names of the server followed by `workers` workers in ordinal order
pub fn all_node_names(prefix: &str, cluster: &str, workers: u32) -> Vec<String> {
    std::iter::once(NodeSlot::Server)
        .chain((0..workers).map(NodeSlot::Worker))
        .map(|slot| node_name(prefix, cluster, slot))
        .collect()
}

/// Recover the slot from a node name (engine names may carry a leading `/`)
pub fn parse_node_name(prefix: &str, cluster: &str, name: &str) -> Option<NodeSlot> {
    let name = name.trim_start_matches('/');
    let rest = name.strip_prefix(&format!("{}-{}-", prefix, cluster))?;
    if rest == "server" {
        return Some(NodeSlot::Server);
    }
    let ordinal = rest.strip_prefix("worker-")?;
    if ordinal.is_empty() || !ordinal.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    ordinal.parse().ok().map(NodeSlot::Worker)
}

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("static regex")
    })
}

/// Check that `name` is a single RFC 1123 host name label
pub fn check_hostname(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".to_string());
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err("must not start or end with '-'".to_string());
    }
    if !hostname_regex().is_match(name) {
        return Err("may only contain 'A-Z', 'a-z', '0-9' and '-' (max 63)".to_string());
    }
    Ok(())
}

/// Validate a cluster name: a host name label of at most
/// [`CLUSTER_NAME_MAX_LEN`] characters
pub fn validate_cluster_name(name: &str) -> Result<()> {
    if name.len() > CLUSTER_NAME_MAX_LEN {
        return Err(ClusterError::InvalidName {
            name: name.to_string(),
            reason: format!("longer than {} characters", CLUSTER_NAME_MAX_LEN),
        });
    }
    check_hostname(name).map_err(|reason| ClusterError::InvalidName {
        name: name.to_string(),
        reason,
    })
}
