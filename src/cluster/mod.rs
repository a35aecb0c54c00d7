//! Cluster management
//!
//! This module provides:
//! - Node naming
//! - The cluster and node model with status classification
//! - Reading clusters back from engine labels
//! - The lifecycle controller (create, delete, stop, start, credentials)

pub mod lifecycle;
pub mod model;
pub mod naming;
pub mod secret;
pub mod state;
pub mod store;

pub use lifecycle::{wait_policy, ClusterController, CreateRequest};
pub use model::{cluster_status, Cluster, ClusterStatus, ContainerState, Node};
pub use naming::{node_name, validate_cluster_name, NodeRole, NodeSlot};
pub use state::StateReader;
pub use store::ClusterDirs;
