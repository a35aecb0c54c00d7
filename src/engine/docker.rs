//! Docker engine client over the local socket

use super::{
    ContainerEngine, ContainerSpec, ContainerSummary, LabelFilter, NetworkSpec, NetworkSummary,
    PortSummary,
};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;

/// Container engine backed by the local Docker daemon
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect with the local defaults (`DOCKER_HOST` or the unix socket)
    /// and make sure the daemon answers.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ClusterError::EngineUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| ClusterError::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn label_filters(filter: &LabelFilter) -> HashMap<String, Vec<String>> {
    HashMap::from([("label".to_string(), filter.to_pairs())])
}

/// Split `repo[:tag]` into repository and tag; a colon before the last `/`
/// belongs to a registry port.
fn split_tag(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

fn host_config(spec: &ContainerSpec) -> HostConfig {
    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .ports
        .bindings()
        .iter()
        .map(|(key, list)| {
            let bindings = list
                .iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip.clone(),
                    host_port: b.host_port.map(|p| p.to_string()),
                })
                .collect();
            (key.to_string(), Some(bindings))
        })
        .collect();

    let tmpfs: HashMap<String, String> = spec
        .tmpfs
        .iter()
        .map(|path| (path.clone(), String::new()))
        .collect();

    HostConfig {
        port_bindings: Some(port_bindings),
        privileged: Some(spec.privileged),
        binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
        tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn version(&self) -> Result<String> {
        let version = self.docker.version().await?;
        Ok(version.api_version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let labels: HashMap<&str, &str> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let options = CreateNetworkOptions {
            name: spec.name.as_str(),
            driver: "bridge",
            labels,
            ..Default::default()
        };

        self.docker.create_network(options).await?;
        tracing::debug!("Created network {}", spec.name);

        // Networks are addressable by name as well as by id
        Ok(spec.name.clone())
    }

    async fn list_networks(&self, filter: &LabelFilter) -> Result<Vec<NetworkSummary>> {
        let options = ListNetworksOptions {
            filters: label_filters(filter),
        };

        let networks = self.docker.list_networks(Some(options)).await?;
        Ok(networks
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                labels: n.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        self.docker.remove_network(id).await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str, verbose: bool) -> Result<()> {
        let (repository, tag) = split_tag(image);
        let options = CreateImageOptions {
            from_image: repository,
            tag,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    let status = info.status.unwrap_or_default();
                    let progress = info.progress.unwrap_or_default();
                    if verbose {
                        println!("{} {}", status, progress);
                    } else {
                        tracing::debug!("Pull {}: {} {}", image, status, progress);
                    }
                }
                Err(e) => {
                    return Err(ClusterError::Engine(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    )));
                }
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .exposed()
            .map(|key| (key.to_string(), HashMap::new()))
            .collect();

        let endpoint = EndpointSettings {
            aliases: Some(spec.aliases.clone()),
            ..Default::default()
        };

        let config = Config {
            hostname: Some(spec.hostname.clone()),
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config(spec)),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(spec.network.clone(), endpoint)]),
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            tracing::warn!("Container {}: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker.stop_container(id, None).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn list_containers(&self, filter: &LabelFilter, all: bool) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions {
            all,
            filters: label_filters(filter),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
                ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .map(|p| PortSummary {
                        private_port: p.private_port,
                        public_port: p.public_port,
                        protocol: p.typ.map(|t| t.to_string()),
                    })
                    .collect(),
                created: c.created,
            })
            .collect())
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut logs = String::new();
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(result) = stream.next().await {
            match result? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::StdIn { message }
                | LogOutput::Console { message } => {
                    logs.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }
        Ok(logs)
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions { path };

        let mut archive = Vec::new();
        let mut stream = self.docker.download_from_container(id, Some(options));
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PublishedPortSet;

    #[test]
    fn test_split_tag() {
        assert_eq!(
            split_tag("docker.io/rancher/k3s:v1.29.4-k3s1"),
            ("docker.io/rancher/k3s", "v1.29.4-k3s1")
        );
        assert_eq!(split_tag("docker.io/rancher/k3s"), ("docker.io/rancher/k3s", "latest"));
        assert_eq!(
            split_tag("localhost:5000/k3s"),
            ("localhost:5000/k3s", "latest")
        );
    }

    #[test]
    fn test_host_config_carries_bindings_and_tmpfs() {
        let spec = ContainerSpec {
            name: "k3box-t1-worker-0".to_string(),
            ports: PublishedPortSet::from_specs(&["8081:80", "127.0.0.1::53/udp"]).unwrap(),
            tmpfs: vec!["/run".to_string(), "/var/run".to_string()],
            privileged: true,
            ..Default::default()
        };

        let config = host_config(&spec);
        let bindings = config.port_bindings.unwrap();
        let tcp = bindings["80/tcp"].as_ref().unwrap();
        assert_eq!(tcp[0].host_port.as_deref(), Some("8081"));
        let udp = bindings["53/udp"].as_ref().unwrap();
        assert_eq!(udp[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(udp[0].host_port, None);

        assert_eq!(config.tmpfs.unwrap().len(), 2);
        assert_eq!(config.privileged, Some(true));
        assert_eq!(config.binds, None);
    }
}
