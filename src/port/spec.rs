//! Port rule grammar
//!
//! A rule reads `[host-ip:][host-port:]container-port[/protocol](@selector)*`.
//! Ports may be ranges (`8000-8009:80-89`) as long as both sides have the
//! same length. IPv6 host addresses are written in brackets.

use crate::cluster::naming::check_hostname;
use crate::error::{ClusterError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::OnceLock;

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container-side key of a published port, rendered as `80/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortKey {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortKey {
    pub fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl std::fmt::Display for PortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Host side of a published port. An absent port lets the engine pick one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

/// Node selector attached to a rule with `@`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Selector {
    /// Every node
    All,
    /// The server
    Server,
    /// Alias of `server`
    Master,
    /// Every worker
    Workers,
    /// One node by name
    Node(String),
}

impl Selector {
    /// Parse a role-group name
    pub fn parse_group(token: &str) -> Option<Self> {
        match token {
            "all" => Some(Selector::All),
            "server" => Some(Selector::Server),
            "master" => Some(Selector::Master),
            "workers" => Some(Selector::Workers),
            _ => None,
        }
    }

    /// Parse a selector token against the node names of the cluster
    pub fn parse(token: &str, known_nodes: &[String]) -> Option<Self> {
        Self::parse_group(token).or_else(|| {
            known_nodes
                .iter()
                .any(|n| n == token)
                .then(|| Selector::Node(token.to_string()))
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            Selector::All => "all",
            Selector::Server => "server",
            Selector::Master => "master",
            Selector::Workers => "workers",
            Selector::Node(name) => name,
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a rule into its selector tokens and its port part. A rule without
/// selectors gets `default`.
pub fn extract_nodes<'a>(spec: &'a str, default: &Selector) -> (Vec<String>, &'a str) {
    let mut parts = spec.split('@');
    let port_spec = parts.next().unwrap_or_default();
    let mut nodes: Vec<String> = parts.map(str::to_string).collect();
    if nodes.is_empty() {
        nodes.push(default.to_string());
    }
    (nodes, port_spec)
}

fn port_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(?:-(\d+))?$").expect("static regex"))
}

/// Parse `N` or `N-M` into an inclusive range
fn parse_range(spec: &str, token: &str, what: &str) -> Result<(u16, u16)> {
    let caps = port_token_regex()
        .captures(token)
        .ok_or_else(|| ClusterError::malformed(spec, format!("{} '{}' is not a port", what, token)))?;

    let parse = |s: &str| -> Result<u16> {
        match s.parse::<u32>() {
            Ok(p) if (1..=65535).contains(&p) => Ok(p as u16),
            _ => Err(ClusterError::invalid_binding(
                spec,
                format!("{} '{}' is out of range 1-65535", what, s),
            )),
        }
    };

    let start = parse(&caps[1])?;
    let end = match caps.get(2) {
        Some(m) => parse(m.as_str())?,
        None => start,
    };
    if end < start {
        return Err(ClusterError::invalid_binding(
            spec,
            format!("{} range '{}' is reversed", what, token),
        ));
    }
    Ok((start, end))
}

/// Split the address part into (host-ip, host-port, container-port)
fn split_parts<'a>(spec: &str, raw: &'a str) -> Result<(&'a str, &'a str, &'a str)> {
    if let Some(bracketed) = raw.strip_prefix('[') {
        let (ip, rest) = bracketed
            .split_once(']')
            .ok_or_else(|| ClusterError::malformed(spec, "unterminated '[' in host ip"))?;
        let rest = rest
            .strip_prefix(':')
            .ok_or_else(|| ClusterError::malformed(spec, "expected ':' after host ip"))?;
        let parts: Vec<&str> = rest.split(':').collect();
        return match parts.as_slice() {
            [host, container] => Ok((ip, host, container)),
            _ => Err(ClusterError::malformed(
                spec,
                "expected [ip]:host-port:container-port",
            )),
        };
    }

    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [container] => Ok(("", "", container)),
        [host, container] => Ok(("", host, container)),
        [ip, host, container] => Ok((ip, host, container)),
        _ => Err(ClusterError::malformed(spec, "too many ':' separated parts")),
    }
}

/// Parse the port part of a rule (no selectors) into concrete
/// (container key, host binding) pairs
pub fn parse_port_spec(spec: &str) -> Result<Vec<(PortKey, HostBinding)>> {
    if spec.contains('@') {
        return Err(ClusterError::malformed(spec, "selectors must be stripped first"));
    }

    let (raw, protocol) = match spec.rsplit_once('/') {
        Some((raw, proto)) => {
            let protocol = Protocol::parse(proto).ok_or_else(|| {
                ClusterError::invalid_binding(spec, format!("unsupported protocol '{}'", proto))
            })?;
            (raw, protocol)
        }
        None => (spec, Protocol::Tcp),
    };

    let (ip, host, container) = split_parts(spec, raw)?;

    if container.is_empty() {
        return Err(ClusterError::malformed(spec, "missing container port"));
    }

    let host_ip = if ip.is_empty() {
        None
    } else {
        ip.parse::<IpAddr>().map_err(|_| {
            ClusterError::invalid_binding(spec, format!("'{}' is not an ip address", ip))
        })?;
        Some(ip.to_string())
    };

    let (c_start, c_end) = parse_range(spec, container, "container port")?;
    let host_range = if host.is_empty() {
        None
    } else {
        Some(parse_range(spec, host, "host port")?)
    };

    if let Some((h_start, h_end)) = host_range {
        if h_end - h_start != c_end - c_start {
            return Err(ClusterError::invalid_binding(
                spec,
                "host and container port ranges differ in length",
            ));
        }
    }

    let mappings = (0..=(c_end - c_start))
        .map(|i| {
            let key = PortKey::new(c_start + i, protocol);
            let binding = HostBinding {
                host_ip: host_ip.clone(),
                host_port: host_range.map(|(h_start, _)| h_start + i),
            };
            (key, binding)
        })
        .collect();

    Ok(mappings)
}

/// Validate a full rule (port part and selector syntax, not selector targets)
pub fn validate_rule(rule: &str) -> Result<()> {
    let mut parts = rule.split('@');
    let port_spec = parts.next().unwrap_or_default();
    parse_port_spec(port_spec)?;
    for token in parts {
        check_hostname(token).map_err(|reason| {
            ClusterError::malformed(rule, format!("invalid node selector '{}': {}", token, reason))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(ip: Option<&str>, port: Option<u16>) -> HostBinding {
        HostBinding {
            host_ip: ip.map(str::to_string),
            host_port: port,
        }
    }

    #[test]
    fn test_extract_nodes() {
        let (nodes, port) = extract_nodes("192.168.0.1:8080:80/udp@sel1@sel2", &Selector::Server);
        assert_eq!(nodes, vec!["sel1", "sel2"]);
        assert_eq!(port, "192.168.0.1:8080:80/udp");

        let (nodes, port) = extract_nodes("8080:80", &Selector::Server);
        assert_eq!(nodes, vec!["server"]);
        assert_eq!(port, "8080:80");

        let (nodes, _) = extract_nodes("8080:80", &Selector::All);
        assert_eq!(nodes, vec!["all"]);
    }

    #[test]
    fn test_parse_container_port_only() {
        let parsed = parse_port_spec("80").unwrap();
        assert_eq!(parsed, vec![(PortKey::new(80, Protocol::Tcp), binding(None, None))]);
    }

    #[test]
    fn test_parse_full_spec() {
        let parsed = parse_port_spec("127.0.0.1:8080:80/udp").unwrap();
        assert_eq!(
            parsed,
            vec![(
                PortKey::new(80, Protocol::Udp),
                binding(Some("127.0.0.1"), Some(8080))
            )]
        );

        let parsed = parse_port_spec("[::1]:8443:443").unwrap();
        assert_eq!(parsed[0].1, binding(Some("::1"), Some(8443)));

        let parsed = parse_port_spec("0.0.0.0::53/UDP").unwrap();
        assert_eq!(parsed[0].0, PortKey::new(53, Protocol::Udp));
        assert_eq!(parsed[0].1, binding(Some("0.0.0.0"), None));
    }

    #[test]
    fn test_parse_ranges() {
        let parsed = parse_port_spec("8000-8002:80-82").unwrap();
        let ports: Vec<_> = parsed
            .iter()
            .map(|(k, b)| (k.port, b.host_port.unwrap()))
            .collect();
        assert_eq!(ports, vec![(80, 8000), (81, 8001), (82, 8002)]);
    }

    #[test]
    fn test_malformed_specs() {
        for spec in ["", "a:b:c:d", "http", "80/", "[::1:80"] {
            let err = parse_port_spec(spec).unwrap_err();
            assert!(err.is_validation(), "{} should be rejected", spec);
        }
        assert!(matches!(
            parse_port_spec("1:2:3:4").unwrap_err(),
            ClusterError::MalformedSpec { .. }
        ));
    }

    #[test]
    fn test_invalid_bindings() {
        for spec in ["0", "70000", "8080:80/sctp", "90-80", "8000-8001:80", "1.2.3:80:80"] {
            assert!(
                matches!(
                    parse_port_spec(spec),
                    Err(ClusterError::InvalidPortBinding { .. })
                ),
                "{} should be an invalid binding",
                spec
            );
        }
    }

    #[test]
    fn test_validate_rule_selectors() {
        assert!(validate_rule("8080:80@workers@k3box-t1-server").is_ok());
        assert!(validate_rule("8080:80@").is_err());
        assert!(validate_rule("8080:80@bad_name").is_err());
    }

    #[test]
    fn test_selector_parse() {
        let known = vec!["k3box-t1-worker-0".to_string()];
        assert_eq!(Selector::parse("master", &known), Some(Selector::Master));
        assert_eq!(
            Selector::parse("k3box-t1-worker-0", &known),
            Some(Selector::Node("k3box-t1-worker-0".to_string()))
        );
        assert_eq!(Selector::parse("k3box-t1-worker-1", &known), None);
    }
}
