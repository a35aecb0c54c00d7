//! Selector resolution for port rules
//!
//! `PortRules::compile` validates every rule and files its port part under
//! each selector it names. `merge` then collects, for one node, the rules of
//! every role group the node belongs to followed by the rules addressed to
//! the node by name.

use super::published::PublishedPortSet;
use super::spec::{extract_nodes, validate_rule, Selector};
use crate::cluster::naming::NodeRole;
use crate::error::{ClusterError, Result};
use std::collections::HashMap;

const SERVER_GROUPS: &[Selector] = &[Selector::All, Selector::Server, Selector::Master];
const WORKER_GROUPS: &[Selector] = &[Selector::All, Selector::Workers];

/// Role groups a node of `role` belongs to, in merge order
pub fn groups_for(role: NodeRole) -> &'static [Selector] {
    match role {
        NodeRole::Server => SERVER_GROUPS,
        NodeRole::Worker => WORKER_GROUPS,
    }
}

/// Port rules filed by selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRules {
    by_selector: HashMap<Selector, Vec<String>>,
}

impl PortRules {
    /// Validate `specs` and map them to selectors.
    ///
    /// Selectors must be a role group or one of `known_nodes`; anything else
    /// rejects the whole set. Rules without a selector go to `default`.
    pub fn compile(specs: &[String], known_nodes: &[String], default: &Selector) -> Result<Self> {
        for spec in specs {
            validate_rule(spec)?;
        }

        let mut by_selector: HashMap<Selector, Vec<String>> = HashMap::new();
        for spec in specs {
            let (nodes, port_spec) = extract_nodes(spec, default);
            for token in nodes {
                let selector = Selector::parse(&token, known_nodes).ok_or_else(|| {
                    ClusterError::malformed(spec, format!("unknown node selector '{}'", token))
                })?;
                by_selector
                    .entry(selector)
                    .or_default()
                    .push(port_spec.to_string());
            }
        }

        Ok(Self { by_selector })
    }

    /// Rules filed under one selector
    pub fn specs_for(&self, selector: &Selector) -> &[String] {
        self.by_selector
            .get(selector)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Rules that apply to the node `name` of role `role`, first seen first,
    /// without duplicates
    pub fn merge(&self, role: NodeRole, name: &str) -> Vec<String> {
        let by_name = Selector::Node(name.to_string());
        let mut merged: Vec<String> = Vec::new();

        for selector in groups_for(role).iter().chain(std::iter::once(&by_name)) {
            for spec in self.specs_for(selector) {
                if !merged.contains(spec) {
                    merged.push(spec.clone());
                }
            }
        }

        merged
    }

    /// Compile the bindings of one node, with `extra` rules appended
    pub fn published_for(&self, role: NodeRole, name: &str, extra: &[String]) -> Result<PublishedPortSet> {
        let mut specs = self.merge(role, name);
        for spec in extra {
            if !specs.contains(spec) {
                specs.push(spec.clone());
            }
        }
        PublishedPortSet::from_specs(&specs)
    }

    pub fn is_empty(&self) -> bool {
        self.by_selector.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::naming::all_node_names;
    use crate::port::spec::{PortKey, Protocol};

    fn specs(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn nodes() -> Vec<String> {
        all_node_names("k3box", "t1", 2)
    }

    #[test]
    fn test_default_selector_applies_without_at() {
        let rules = PortRules::compile(&specs(&["8080:80"]), &nodes(), &Selector::Server).unwrap();
        assert_eq!(rules.specs_for(&Selector::Server), ["8080:80"]);
        assert!(rules.merge(NodeRole::Worker, "k3box-t1-worker-0").is_empty());

        let rules = PortRules::compile(&specs(&["8080:80"]), &nodes(), &Selector::All).unwrap();
        assert_eq!(rules.merge(NodeRole::Worker, "k3box-t1-worker-0"), ["8080:80"]);
    }

    #[test]
    fn test_unknown_selector_fails_closed() {
        let err = PortRules::compile(&specs(&["8080:80@k3box-t1-worker-7"]), &nodes(), &Selector::Server)
            .unwrap_err();
        assert!(matches!(err, ClusterError::MalformedSpec { .. }));
    }

    #[test]
    fn test_bad_port_part_fails_compile() {
        let err = PortRules::compile(&specs(&["80:80", "x:80@all"]), &nodes(), &Selector::Server)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_worker_merge_skips_server_groups() {
        let rules = PortRules::compile(
            &specs(&[
                "1000@server",
                "1001@master",
                "1002@all",
                "1003@workers",
                "1004@k3box-t1-worker-0",
                "1005@k3box-t1-worker-1",
            ]),
            &nodes(),
            &Selector::Server,
        )
        .unwrap();

        assert_eq!(
            rules.merge(NodeRole::Worker, "k3box-t1-worker-0"),
            ["1002", "1003", "1004"]
        );
        assert_eq!(
            rules.merge(NodeRole::Server, "k3box-t1-server"),
            ["1002", "1000", "1001"]
        );
    }

    #[test]
    fn test_merge_deduplicates_overlapping_groups() {
        let rules = PortRules::compile(
            &specs(&["8080:80@all@workers@k3box-t1-worker-1", "9090:90@workers"]),
            &nodes(),
            &Selector::Server,
        )
        .unwrap();

        assert_eq!(
            rules.merge(NodeRole::Worker, "k3box-t1-worker-1"),
            ["8080:80", "9090:90"]
        );
    }

    #[test]
    fn test_published_for_appends_extra_rules() {
        let rules = PortRules::compile(&specs(&["8080:80@server"]), &nodes(), &Selector::Server).unwrap();
        let set = rules
            .published_for(
                NodeRole::Server,
                "k3box-t1-server",
                &specs(&["0.0.0.0:6443:6443/tcp"]),
            )
            .unwrap();
        let keys: Vec<_> = set.exposed().copied().collect();
        assert_eq!(
            keys,
            vec![PortKey::new(80, Protocol::Tcp), PortKey::new(6443, Protocol::Tcp)]
        );
    }
}
