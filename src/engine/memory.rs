//! In-process container engine
//!
//! Keeps containers and networks in memory and mimics the engine behaviour
//! the controller relies on: label filters, running-only listings, name
//! conflicts, logs and tar-wrapped file copies. Operations can be made to
//! fail per container name to exercise rollback and partial failure paths.

use super::{
    ContainerEngine, ContainerSpec, ContainerSummary, LabelFilter, NetworkSpec, NetworkSummary,
    PortSummary,
};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

const STATE_CREATED: &str = "created";
const STATE_RUNNING: &str = "running";
const STATE_EXITED: &str = "exited";

/// Engine operation that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    CreateContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
    RemoveNetwork,
}

/// A container held by the memory engine
#[derive(Debug, Clone)]
pub struct MemoryContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: String,
    pub logs: String,
    pub created: i64,
}

#[derive(Debug, Default)]
struct Hooks {
    faults: HashSet<(Fault, String)>,
    boot_logs: HashMap<String, String>,
    files: HashMap<(String, String), Vec<u8>>,
    pulled: Vec<String>,
}

fn lock_error(kind: &str) -> ClusterError {
    ClusterError::Engine(format!("Failed to acquire {} lock", kind))
}

fn short_id() -> String {
    Uuid::new_v4().to_string().replace("-", "")[..12].to_string()
}

/// Container engine backed by in-memory maps
#[derive(Debug, Default, Clone)]
pub struct MemoryEngine {
    /// All containers indexed by ID
    containers: Arc<RwLock<HashMap<String, MemoryContainer>>>,
    /// All networks indexed by ID
    networks: Arc<RwLock<HashMap<String, NetworkSummary>>>,
    hooks: Arc<RwLock<Hooks>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fault` fail for the container (or network) called `name`
    pub fn fail(&self, fault: Fault, name: &str) -> Result<()> {
        let mut hooks = self.hooks.write().map_err(|_| lock_error("write"))?;
        hooks.faults.insert((fault, name.to_string()));
        Ok(())
    }

    /// Clear an injected fault
    pub fn heal(&self, fault: Fault, name: &str) -> Result<()> {
        let mut hooks = self.hooks.write().map_err(|_| lock_error("write"))?;
        hooks.faults.remove(&(fault, name.to_string()));
        Ok(())
    }

    /// Text appended to the logs of container `name` every time it starts
    pub fn set_boot_log(&self, name: &str, text: &str) -> Result<()> {
        let mut hooks = self.hooks.write().map_err(|_| lock_error("write"))?;
        hooks.boot_logs.insert(name.to_string(), text.to_string());
        Ok(())
    }

    /// File served by `copy_from_container` for container `name`
    pub fn put_file(&self, name: &str, path: &str, contents: &[u8]) -> Result<()> {
        let mut hooks = self.hooks.write().map_err(|_| lock_error("write"))?;
        hooks
            .files
            .insert((name.to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    /// Images pulled so far, in order
    pub fn pulled_images(&self) -> Result<Vec<String>> {
        let hooks = self.hooks.read().map_err(|_| lock_error("read"))?;
        Ok(hooks.pulled.clone())
    }

    /// Find a container by name
    pub fn find_by_name(&self, name: &str) -> Result<Option<MemoryContainer>> {
        let containers = self.containers.read().map_err(|_| lock_error("read"))?;
        Ok(containers.values().find(|c| c.spec.name == name).cloned())
    }

    /// Names of every container, sorted
    pub fn container_names(&self) -> Result<Vec<String>> {
        let containers = self.containers.read().map_err(|_| lock_error("read"))?;
        let mut names: Vec<String> = containers.values().map(|c| c.spec.name.clone()).collect();
        names.sort();
        Ok(names)
    }

    /// Names of every network, sorted
    pub fn network_names(&self) -> Result<Vec<String>> {
        let networks = self.networks.read().map_err(|_| lock_error("read"))?;
        let mut names: Vec<String> = networks.values().map(|n| n.name.clone()).collect();
        names.sort();
        Ok(names)
    }

    /// Mark a container as exited without going through the controller
    pub fn crash(&self, name: &str) -> Result<()> {
        let mut containers = self.containers.write().map_err(|_| lock_error("write"))?;
        let container = containers
            .values_mut()
            .find(|c| c.spec.name == name)
            .ok_or_else(|| ClusterError::Engine(format!("No such container: {}", name)))?;
        container.state = STATE_EXITED.to_string();
        Ok(())
    }

    fn check_fault(&self, fault: Fault, name: &str) -> Result<()> {
        let hooks = self.hooks.read().map_err(|_| lock_error("read"))?;
        if hooks.faults.contains(&(fault, name.to_string())) {
            return Err(ClusterError::Engine(format!(
                "injected {:?} failure for {}",
                fault, name
            )));
        }
        Ok(())
    }

    fn name_of(&self, id: &str) -> Result<String> {
        let containers = self.containers.read().map_err(|_| lock_error("read"))?;
        containers
            .get(id)
            .map(|c| c.spec.name.clone())
            .ok_or_else(|| ClusterError::Engine(format!("No such container: {}", id)))
    }
}

fn summarize(container: &MemoryContainer) -> ContainerSummary {
    let ports = container
        .spec
        .ports
        .bindings()
        .iter()
        .flat_map(|(key, list)| {
            list.iter().map(move |b| PortSummary {
                private_port: key.port,
                public_port: b.host_port,
                protocol: Some(key.protocol.to_string()),
            })
        })
        .collect();

    ContainerSummary {
        id: container.id.clone(),
        names: vec![format!("/{}", container.spec.name)],
        image: container.spec.image.clone(),
        state: container.state.clone(),
        labels: container.spec.labels.clone(),
        ports,
        created: Some(container.created),
    }
}

fn tar_single_file(path: &str, contents: &[u8]) -> Result<Vec<u8>> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, file_name, contents)?;
    Ok(builder.into_inner()?)
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn version(&self) -> Result<String> {
        Ok("1.45".to_string())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let mut networks = self.networks.write().map_err(|_| lock_error("write"))?;
        if networks.values().any(|n| n.name == spec.name) {
            return Err(ClusterError::Engine(format!(
                "network with name {} already exists",
                spec.name
            )));
        }

        let id = short_id();
        networks.insert(
            id.clone(),
            NetworkSummary {
                id: id.clone(),
                name: spec.name.clone(),
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn list_networks(&self, filter: &LabelFilter) -> Result<Vec<NetworkSummary>> {
        let networks = self.networks.read().map_err(|_| lock_error("read"))?;
        Ok(networks
            .values()
            .filter(|n| filter.matches(&n.labels))
            .cloned()
            .collect())
    }

    async fn remove_network(&self, id: &str) -> Result<()> {
        let name = {
            let networks = self.networks.read().map_err(|_| lock_error("read"))?;
            networks
                .get(id)
                .map(|n| n.name.clone())
                .ok_or_else(|| ClusterError::Engine(format!("No such network: {}", id)))?
        };
        self.check_fault(Fault::RemoveNetwork, &name)?;

        let containers = self.containers.read().map_err(|_| lock_error("read"))?;
        if containers.values().any(|c| c.spec.network == name) {
            return Err(ClusterError::Engine(format!(
                "network {} has active endpoints",
                name
            )));
        }
        drop(containers);

        let mut networks = self.networks.write().map_err(|_| lock_error("write"))?;
        networks.remove(id);
        Ok(())
    }

    async fn pull_image(&self, image: &str, verbose: bool) -> Result<()> {
        if verbose {
            println!("Pulling {}", image);
        }
        let mut hooks = self.hooks.write().map_err(|_| lock_error("write"))?;
        hooks.pulled.push(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check_fault(Fault::CreateContainer, &spec.name)?;

        {
            let networks = self.networks.read().map_err(|_| lock_error("read"))?;
            if !networks.values().any(|n| n.name == spec.network) {
                return Err(ClusterError::Engine(format!(
                    "network {} not found",
                    spec.network
                )));
            }
        }

        let mut containers = self.containers.write().map_err(|_| lock_error("write"))?;
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(ClusterError::Engine(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }

        let id = short_id();
        containers.insert(
            id.clone(),
            MemoryContainer {
                id: id.clone(),
                spec: spec.clone(),
                state: STATE_CREATED.to_string(),
                logs: String::new(),
                created: chrono::Utc::now().timestamp(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.check_fault(Fault::StartContainer, &name)?;

        let boot_log = {
            let hooks = self.hooks.read().map_err(|_| lock_error("read"))?;
            hooks.boot_logs.get(&name).cloned()
        };

        let mut containers = self.containers.write().map_err(|_| lock_error("write"))?;
        if let Some(container) = containers.get_mut(id) {
            container.state = STATE_RUNNING.to_string();
            if let Some(text) = boot_log {
                container.logs.push_str(&text);
                container.logs.push('\n');
            }
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.check_fault(Fault::StopContainer, &name)?;

        let mut containers = self.containers.write().map_err(|_| lock_error("write"))?;
        if let Some(container) = containers.get_mut(id) {
            container.state = STATE_EXITED.to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.check_fault(Fault::RemoveContainer, &name)?;

        let mut containers = self.containers.write().map_err(|_| lock_error("write"))?;
        containers.remove(id);
        Ok(())
    }

    async fn list_containers(&self, filter: &LabelFilter, all: bool) -> Result<Vec<ContainerSummary>> {
        let containers = self.containers.read().map_err(|_| lock_error("read"))?;
        let mut result: Vec<&MemoryContainer> = containers
            .values()
            .filter(|c| all || c.state == STATE_RUNNING)
            .filter(|c| filter.matches(&c.spec.labels))
            .collect();
        result.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        Ok(result.into_iter().map(summarize).collect())
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        let containers = self.containers.read().map_err(|_| lock_error("read"))?;
        containers
            .get(id)
            .map(|c| c.logs.clone())
            .ok_or_else(|| ClusterError::Engine(format!("No such container: {}", id)))
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let name = self.name_of(id)?;
        let hooks = self.hooks.read().map_err(|_| lock_error("read"))?;
        let contents = hooks
            .files
            .get(&(name.clone(), path.to_string()))
            .ok_or_else(|| {
                ClusterError::Engine(format!("Could not find the file {} in container {}", path, name))
            })?;
        tar_single_file(path, contents)
    }
}
