//! Compiled per-node port bindings

use super::spec::{parse_port_spec, HostBinding, PortKey};
use crate::error::{ClusterError, Result};
use std::collections::BTreeMap;

/// Ports a single node exposes, each with its ordered host bindings.
///
/// Every exposed key carries at least one binding, so the exposed set and
/// the binding map always have the same keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishedPortSet {
    bindings: BTreeMap<PortKey, Vec<HostBinding>>,
}

impl PublishedPortSet {
    /// An empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every port rule (selectors already stripped) into one set.
    /// Any rule that fails to parse fails the whole set.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self> {
        specs
            .iter()
            .try_fold(Self::new(), |set, spec| set.add_port(spec.as_ref()))
    }

    /// Return a new set with the bindings of `spec` added
    pub fn add_port(&self, spec: &str) -> Result<Self> {
        let mut next = self.clone();
        for (key, binding) in parse_port_spec(spec)? {
            let list = next.bindings.entry(key).or_default();
            if !list.contains(&binding) {
                list.push(binding);
            }
        }
        Ok(next)
    }

    /// Return a new set with every explicit host port shifted up by `n`.
    /// Container ports and engine-assigned host ports are left alone.
    pub fn offset(&self, n: u32) -> Result<Self> {
        if n == 0 {
            return Ok(self.clone());
        }

        let mut bindings = BTreeMap::new();
        for (key, list) in &self.bindings {
            let shifted = list
                .iter()
                .map(|b| {
                    let host_port = match b.host_port {
                        Some(port) => Some(shift(*key, port, n)?),
                        None => None,
                    };
                    Ok(HostBinding {
                        host_ip: b.host_ip.clone(),
                        host_port,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            bindings.insert(*key, shifted);
        }

        Ok(Self { bindings })
    }

    /// Exposed container ports
    pub fn exposed(&self) -> impl Iterator<Item = &PortKey> {
        self.bindings.keys()
    }

    /// Host bindings per exposed port
    pub fn bindings(&self) -> &BTreeMap<PortKey, Vec<HostBinding>> {
        &self.bindings
    }

    /// Explicit host ports, in key order
    pub fn host_ports(&self) -> Vec<u16> {
        self.bindings
            .values()
            .flatten()
            .filter_map(|b| b.host_port)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}

fn shift(key: PortKey, port: u16, n: u32) -> Result<u16> {
    let shifted = u32::from(port) + n;
    u16::try_from(shifted).map_err(|_| {
        ClusterError::invalid_binding(
            &format!("{}:{}", port, key),
            format!("host port offset by {} exceeds 65535", n),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::spec::Protocol;

    fn sample() -> PublishedPortSet {
        PublishedPortSet::from_specs(&["8080:80", "127.0.0.1:5353:53/udp", "9000"]).unwrap()
    }

    #[test]
    fn test_from_specs_exposes_every_bound_key() {
        let set = sample();
        let exposed: Vec<_> = set.exposed().map(|k| k.to_string()).collect();
        assert_eq!(exposed, vec!["53/udp", "80/tcp", "9000/tcp"]);
        assert_eq!(set.bindings().len(), set.exposed().count());
        assert_eq!(
            set.bindings()[&PortKey::new(9000, Protocol::Tcp)],
            vec![HostBinding::default()]
        );
    }

    #[test]
    fn test_same_container_port_collects_bindings_in_order() {
        let set = PublishedPortSet::from_specs(&["8080:80", "8081:80", "8080:80"]).unwrap();
        let list = &set.bindings()[&PortKey::new(80, Protocol::Tcp)];
        let ports: Vec<_> = list.iter().map(|b| b.host_port.unwrap()).collect();
        assert_eq!(ports, vec![8080, 8081]);
    }

    #[test]
    fn test_one_bad_spec_fails_the_set() {
        let result = PublishedPortSet::from_specs(&["8080:80", "8080:80/sctp"]);
        assert!(matches!(result, Err(ClusterError::InvalidPortBinding { .. })));
    }

    #[test]
    fn test_offset_zero_is_identity() {
        let set = sample();
        assert_eq!(set.offset(0).unwrap(), set);
    }

    // Offsets are additive; a multiplicative shift would break both checks below.
    #[test]
    fn test_offset_is_additive_and_composes() {
        let set = sample();
        let shifted = set.offset(3).unwrap();
        assert_eq!(shifted.host_ports(), vec![5356, 8083]);
        assert_eq!(
            shifted.exposed().collect::<Vec<_>>(),
            set.exposed().collect::<Vec<_>>()
        );

        assert_eq!(set.offset(2).unwrap().offset(5).unwrap(), set.offset(7).unwrap());
    }

    #[test]
    fn test_offset_leaves_ephemeral_ports() {
        let set = PublishedPortSet::from_specs(&["80"]).unwrap();
        assert_eq!(set.offset(10).unwrap(), set);
    }

    #[test]
    fn test_offset_overflow_is_rejected() {
        let set = PublishedPortSet::from_specs(&["65535:80"]).unwrap();
        assert!(matches!(
            set.offset(1),
            Err(ClusterError::InvalidPortBinding { .. })
        ));
    }
}
