//! k3box - disposable multi-node k3s clusters on a local container engine
//!
//! Every cluster is one private network, one server container and any number
//! of worker containers. The engine's labels are the only record of what
//! exists. This crate provides:
//!
//! - Port rule parsing and per-node port publishing
//! - Node naming
//! - Reading cluster state back from the engine
//! - Cluster lifecycle (create, delete, stop, start, credentials)

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod port;

pub use error::{ClusterError, Result};
