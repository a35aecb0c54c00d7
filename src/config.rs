//! Settings shared by every cluster operation
//!
//! A `Settings` value is built once per invocation (defaults, optionally
//! overlaid by a YAML file) and handed to the controller by value. Nothing in
//! the crate keeps process-wide mutable defaults.

use crate::cluster::naming::{check_hostname, node_name, NodeSlot, CLUSTER_NAME_MAX_LEN};
use crate::error::{ClusterError, Result};
use crate::port::Selector;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the settings file looked up under the config root
pub const SETTINGS_FILE: &str = "config.yaml";

/// Immutable configuration for the cluster controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Value of the `app` label stamped on every container and network
    pub app_label: String,
    /// Prefix of every node container name
    pub node_prefix: String,
    /// Cluster name used when none is given
    pub default_cluster_name: String,
    /// Image used when none is given
    pub default_image: String,
    /// Registry prepended to short image references
    pub default_registry: String,
    /// Port the server's API listens on (and is published on)
    pub api_port: u16,
    /// Substring in the server log that marks the cluster as ready
    pub readiness_marker: String,
    /// Path of the generated credentials file inside the server container
    pub kubeconfig_path: String,
    /// Readiness poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Selector applied to port rules that carry no `@selector`
    pub default_port_selector: String,
    /// Length of generated cluster secrets and tokens
    pub secret_length: usize,
    /// Root for per-cluster bookkeeping directories
    pub config_root: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_label: "k3box".to_string(),
            node_prefix: "k3box".to_string(),
            default_cluster_name: "k3s-default".to_string(),
            default_image: "rancher/k3s:v1.29.4-k3s1".to_string(),
            default_registry: "docker.io".to_string(),
            api_port: 6443,
            readiness_marker: "Running kubelet".to_string(),
            kubeconfig_path: "/output/kubeconfig.yaml".to_string(),
            poll_interval_ms: 1000,
            default_port_selector: "server".to_string(),
            secret_length: 20,
            config_root: None,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from `<config root>/config.yaml` when it
    /// exists. Missing keys keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_root()
                .map(|root| root.join(SETTINGS_FILE))
                .filter(|p| p.exists()),
        };

        let settings = match candidate {
            Some(file) => {
                tracing::debug!("Loading settings from {}", file.display());
                let content = std::fs::read_to_string(&file)?;
                Self::parse_str(&content)?
            }
            None => Self::default(),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML document
    pub fn parse_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reject settings the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.app_label.is_empty() {
            return Err(ClusterError::Config("app_label must not be empty".to_string()));
        }
        if self.readiness_marker.is_empty() {
            return Err(ClusterError::Config(
                "readiness_marker must not be empty".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ClusterError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.api_port == 0 {
            return Err(ClusterError::Config("api_port must not be 0".to_string()));
        }
        check_hostname(&self.node_prefix).map_err(|reason| {
            ClusterError::Config(format!("node_prefix '{}' {}", self.node_prefix, reason))
        })?;
        let longest = node_name(
            &self.node_prefix,
            &"a".repeat(CLUSTER_NAME_MAX_LEN),
            NodeSlot::Worker(u32::MAX),
        );
        check_hostname(&longest).map_err(|_| {
            ClusterError::Config(format!(
                "node_prefix '{}' is too long for node names of at most 63 characters",
                self.node_prefix
            ))
        })?;
        Selector::parse_group(&self.default_port_selector).ok_or_else(|| {
            ClusterError::Config(format!(
                "default_port_selector must be a role group, got '{}'",
                self.default_port_selector
            ))
        })?;
        Ok(())
    }

    /// Readiness poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Root directory for cluster bookkeeping
    pub fn config_root(&self) -> Result<PathBuf> {
        match &self.config_root {
            Some(root) => Ok(root.clone()),
            None => default_config_root().ok_or_else(|| {
                ClusterError::Config("could not determine the home directory".to_string())
            }),
        }
    }

    /// Selector used for port rules without an explicit `@selector`
    pub fn default_selector(&self) -> Selector {
        Selector::parse_group(&self.default_port_selector).unwrap_or(Selector::Server)
    }

    /// Qualify a short image reference with the default registry
    pub fn qualify_image(&self, image: &str) -> String {
        if image.split('/').count() <= 2 {
            format!("{}/{}", self.default_registry, image)
        } else {
            image.to_string()
        }
    }
}

/// `$HOME/.config/k3box`
fn default_config_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("k3box"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.api_port, 6443);
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.default_selector(), Selector::Server);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
api_port: 7443
readiness_marker: "k3s is up"
"#;
        let settings = Settings::parse_str(yaml).unwrap();
        assert_eq!(settings.api_port, 7443);
        assert_eq!(settings.readiness_marker, "k3s is up");
        assert_eq!(settings.app_label, "k3box");
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("settings.yaml");
        std::fs::write(&path, "default_port_selector: all\nsecret_length: 32\n").unwrap();

        let settings = Settings::load(Some(path.as_path())).unwrap();
        assert_eq!(settings.default_selector(), Selector::All);
        assert_eq!(settings.secret_length, 32);
    }

    #[test]
    fn test_default_selector_must_be_group() {
        let settings = Settings {
            default_port_selector: "k3box-t1-worker-0".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_node_prefix_must_fit_host_names() {
        let long = "k".repeat(20);
        for prefix in ["my_prefix", "", "-k3box", long.as_str()] {
            let settings = Settings {
                node_prefix: prefix.to_string(),
                ..Settings::default()
            };
            assert!(
                matches!(settings.validate(), Err(ClusterError::Config(_))),
                "{:?}",
                prefix
            );
        }

        let settings = Settings::parse_str("node_prefix: lab-k3s\n").unwrap();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_qualify_image() {
        let settings = Settings::default();
        assert_eq!(
            settings.qualify_image("rancher/k3s:v1.29.4-k3s1"),
            "docker.io/rancher/k3s:v1.29.4-k3s1"
        );
        assert_eq!(settings.qualify_image("k3s"), "docker.io/k3s");
        assert_eq!(
            settings.qualify_image("ghcr.io/acme/k3s:dev"),
            "ghcr.io/acme/k3s:dev"
        );
    }
}
