//! Port publishing
//!
//! Turns user port rules such as `0.0.0.0:8080:80/tcp@workers` into the
//! exposed ports and host bindings of each node.

pub mod published;
pub mod resolver;
pub mod spec;

pub use published::PublishedPortSet;
pub use resolver::PortRules;
pub use spec::{extract_nodes, HostBinding, PortKey, Protocol, Selector};
