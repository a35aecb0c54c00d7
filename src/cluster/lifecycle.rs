//! Cluster lifecycle controller
//!
//! Creates, deletes, stops and starts clusters and extracts their
//! credentials. Every input is validated and every node's port bindings are
//! compiled before the first engine call. Bulk operations keep going past
//! single node failures and report them together at the end.

use super::model::Cluster;
use super::naming::{all_node_names, node_name, validate_cluster_name, NodeRole, NodeSlot};
use super::secret::JoinSecrets;
use super::state::StateReader;
use super::store::{extract_archived_file, ClusterDirs};
use crate::config::Settings;
use crate::engine::{
    ContainerEngine, ContainerSpec, NetworkSpec, LABEL_APP, LABEL_CLUSTER,
    LABEL_COMPONENT, LABEL_CREATED,
};
use crate::error::{ClusterError, NodeFailure, Result};
use crate::port::{PortRules, PublishedPortSet};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Paths mounted as tmpfs on worker nodes
const WORKER_TMPFS: &[&str] = &["/run", "/var/run"];

/// Turn the `--wait` / `--timeout` flag pair into a wait duration.
///
/// A timeout needs `--wait`. A zero (or absent) timeout with `--wait` waits
/// without limit.
pub fn wait_policy(wait: bool, timeout_secs: Option<u64>) -> Result<Option<Duration>> {
    match (wait, timeout_secs) {
        (false, Some(_)) => Err(ClusterError::ConflictingFlags(
            "cannot use --timeout without --wait".to_string(),
        )),
        (false, None) => Ok(None),
        (true, secs) => Ok(Some(Duration::from_secs(secs.unwrap_or(0)))),
    }
}

/// Parameters of a create call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateRequest {
    /// Cluster name
    pub name: String,
    /// Image reference; the configured default when absent
    pub image: Option<String>,
    /// Port rules
    pub publish: Vec<String>,
    /// Bind mounts passed to every node
    pub volumes: Vec<String>,
    /// Number of workers
    pub workers: u32,
    /// Extra server environment entries
    pub env: Vec<String>,
    /// Extra server arguments
    pub server_args: Vec<String>,
    /// API port; the configured one when absent
    pub api_port: Option<u16>,
    /// Readiness wait; zero waits without limit, `None` does not wait
    pub wait: Option<Duration>,
    /// Base of the per-worker host port offset; no offset when absent
    pub port_auto_offset: Option<u16>,
    /// Stream pull progress to stdout
    pub verbose: bool,
}

impl CreateRequest {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    pub fn publish(mut self, spec: &str) -> Self {
        self.publish.push(spec.to_string());
        self
    }

    pub fn volume(mut self, spec: &str) -> Self {
        self.volumes.push(spec.to_string());
        self
    }

    pub fn workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    pub fn env(mut self, entry: &str) -> Self {
        self.env.push(entry.to_string());
        self
    }

    pub fn server_arg(mut self, arg: &str) -> Self {
        self.server_args.push(arg.to_string());
        self
    }

    pub fn api_port(mut self, port: u16) -> Self {
        self.api_port = Some(port);
        self
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn port_auto_offset(mut self, base: u16) -> Self {
        self.port_auto_offset = Some(base);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Everything a create call needs, computed before touching the engine
struct CreatePlan {
    image: String,
    network: String,
    server: ContainerSpec,
    workers: Vec<ContainerSpec>,
}

/// Resources created so far by one create call
#[derive(Default)]
struct Rollback {
    /// Name and id of the network
    network: Option<(String, String)>,
    /// Name and id of every container, in creation order
    containers: Vec<(String, String)>,
}

/// Drives cluster state transitions against a container engine
pub struct ClusterController {
    engine: Arc<dyn ContainerEngine>,
    settings: Settings,
    reader: StateReader,
    dirs: ClusterDirs,
}

impl ClusterController {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: Settings) -> Result<Self> {
        let dirs = ClusterDirs::from_settings(&settings)?;
        let reader = StateReader::new(engine.clone(), &settings);
        Ok(Self {
            engine,
            settings,
            reader,
            dirs,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn reader(&self) -> &StateReader {
        &self.reader
    }

    pub fn dirs(&self) -> &ClusterDirs {
        &self.dirs
    }

    /// Ping the engine and return its API version
    pub async fn check_engine(&self) -> Result<String> {
        tracing::info!("Checking container engine...");
        let version = self
            .engine
            .version()
            .await
            .map_err(|e| ClusterError::EngineUnavailable(e.to_string()))?;
        tracing::info!("Container engine is reachable (API: v{})", version);
        Ok(version)
    }

    /// Clusters as currently reported by the engine
    pub async fn list(&self, all: bool, name: Option<&str>) -> Result<BTreeMap<String, Cluster>> {
        self.reader.list(all, name).await
    }

    fn labels(&self, cluster: &str, role: Option<NodeRole>) -> HashMap<String, String> {
        let mut labels = HashMap::from([
            (LABEL_APP.to_string(), self.settings.app_label.clone()),
            (LABEL_CLUSTER.to_string(), cluster.to_string()),
        ]);
        if let Some(role) = role {
            labels.insert(LABEL_COMPONENT.to_string(), role.as_str().to_string());
            labels.insert(
                LABEL_CREATED.to_string(),
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            );
        }
        labels
    }

    fn network_name(&self, cluster: &str) -> String {
        format!("{}-{}", self.settings.node_prefix, cluster)
    }

    /// Validate a request and build every container spec it implies
    fn plan(&self, req: &CreateRequest) -> Result<CreatePlan> {
        validate_cluster_name(&req.name)?;

        let prefix = &self.settings.node_prefix;
        let api_port = req.api_port.unwrap_or(self.settings.api_port);
        if api_port == 0 {
            return Err(ClusterError::invalid_binding("0", "api port must not be 0"));
        }
        let image = self.settings.qualify_image(
            req.image
                .as_deref()
                .unwrap_or(&self.settings.default_image),
        );

        let known_nodes = all_node_names(prefix, &req.name, req.workers);
        let rules = PortRules::compile(&req.publish, &known_nodes, &self.settings.default_selector())?;

        let network = self.network_name(&req.name);
        let kubeconfig_env = format!("K3S_KUBECONFIG_OUTPUT={}", self.settings.kubeconfig_path);
        let secrets = (req.workers > 0).then(|| JoinSecrets::generate(self.settings.secret_length));
        let secret_env = secrets.as_ref().map(JoinSecrets::env).unwrap_or_default();

        let server_name = node_name(prefix, &req.name, NodeSlot::Server);
        let api_spec = format!("0.0.0.0:{}:{}/tcp", api_port, api_port);
        let server_ports = rules.published_for(NodeRole::Server, &server_name, &[api_spec])?;

        let mut server_env = vec![kubeconfig_env.clone()];
        server_env.extend(req.env.iter().cloned());
        server_env.extend(secret_env.iter().cloned());

        let mut server_cmd = vec![
            "server".to_string(),
            "--https-listen-port".to_string(),
            api_port.to_string(),
        ];
        server_cmd.extend(req.server_args.iter().cloned());

        let server = ContainerSpec {
            name: server_name.clone(),
            hostname: server_name.clone(),
            image: image.clone(),
            cmd: server_cmd,
            env: server_env,
            labels: self.labels(&req.name, Some(NodeRole::Server)),
            ports: server_ports,
            binds: req.volumes.clone(),
            tmpfs: Vec::new(),
            privileged: true,
            network: network.clone(),
            aliases: vec![server_name.clone()],
        };

        let mut workers = Vec::new();
        for ordinal in 0..req.workers {
            let worker_name = node_name(prefix, &req.name, NodeSlot::Worker(ordinal));
            let ports = rules.published_for(NodeRole::Worker, &worker_name, &[])?;
            let ports = worker_offset(ports, req.port_auto_offset, ordinal)?;

            let mut env = vec![kubeconfig_env.clone()];
            env.extend(secret_env.iter().cloned());
            env.push(format!("K3S_URL=https://{}:{}", server_name, api_port));

            workers.push(ContainerSpec {
                name: worker_name.clone(),
                hostname: worker_name.clone(),
                image: image.clone(),
                cmd: Vec::new(),
                env,
                labels: self.labels(&req.name, Some(NodeRole::Worker)),
                ports,
                binds: req.volumes.clone(),
                tmpfs: WORKER_TMPFS.iter().map(|p| p.to_string()).collect(),
                privileged: true,
                network: network.clone(),
                aliases: vec![worker_name],
            });
        }

        Ok(CreatePlan {
            image,
            network,
            server,
            workers,
        })
    }

    /// Create a cluster and return it as read back from the engine.
    ///
    /// Any failure after the first engine call removes everything created so
    /// far. If that cleanup fails too, the error lists what was left behind.
    pub async fn create(&self, req: &CreateRequest) -> Result<Cluster> {
        let plan = self.plan(req)?;

        if !self.reader.servers_of(&req.name).await?.is_empty()
            || !self.reader.networks_of(&req.name).await?.is_empty()
        {
            return Err(ClusterError::ClusterExists(req.name.clone()));
        }

        tracing::info!("Creating cluster {}", req.name);
        let mut rollback = Rollback::default();
        match self.provision(req, &plan, &mut rollback).await {
            Ok(()) => {
                tracing::info!("Created cluster {}", req.name);
                self.reader.get(&req.name).await
            }
            Err(cause) => {
                tracing::error!("Failed to create cluster {}: {}", req.name, cause);
                Err(self.roll_back(&req.name, rollback, cause).await)
            }
        }
    }

    async fn provision(&self, req: &CreateRequest, plan: &CreatePlan, rollback: &mut Rollback) -> Result<()> {
        let network = NetworkSpec {
            name: plan.network.clone(),
            labels: self.labels(&req.name, None),
        };
        let network_id = self.engine.create_network(&network).await?;
        tracing::info!("Created cluster network {}", network_id);
        rollback.network = Some((plan.network.clone(), network_id));

        tracing::info!("Pulling image {}...", plan.image);
        self.engine.pull_image(&plan.image, req.verbose).await?;

        tracing::info!("Creating server {}", plan.server.name);
        let server_id = self.run_node(&plan.server, rollback).await?;

        if let Some(timeout) = req.wait {
            self.wait_for_ready(&req.name, &server_id, timeout).await?;
        }

        if !plan.workers.is_empty() {
            tracing::info!("Booting {} workers for cluster {}", plan.workers.len(), req.name);
        }
        for worker in &plan.workers {
            let id = self.run_node(worker, rollback).await?;
            tracing::info!("Created worker {} ({})", worker.name, id);
        }

        self.dirs.create(&req.name)?;
        Ok(())
    }

    async fn run_node(&self, spec: &ContainerSpec, rollback: &mut Rollback) -> Result<String> {
        let id = self.engine.create_container(spec).await?;
        rollback.containers.push((spec.name.clone(), id.clone()));
        self.engine.start_container(&id).await?;
        Ok(id)
    }

    /// Poll the server log until it carries the readiness marker. A zero
    /// timeout polls forever.
    async fn wait_for_ready(&self, cluster: &str, server_id: &str, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            if !timeout.is_zero() && start.elapsed() > timeout {
                return Err(ClusterError::Timeout(format!(
                    "cluster {} was not ready after {}s",
                    cluster,
                    timeout.as_secs_f64()
                )));
            }

            let logs = self.engine.container_logs(server_id).await?;
            if logs.contains(&self.settings.readiness_marker) {
                tracing::info!("Cluster {} is ready", cluster);
                return Ok(());
            }

            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    async fn roll_back(&self, cluster: &str, rollback: Rollback, cause: ClusterError) -> ClusterError {
        tracing::warn!("Rolling back cluster {}", cluster);
        let mut leftovers = Vec::new();

        for (name, id) in rollback.containers.iter().rev() {
            if let Err(e) = self.engine.remove_container(id).await {
                tracing::error!("Failed to remove {} during rollback: {}", name, e);
                leftovers.push(NodeFailure::new(cluster, name, e));
            }
        }

        if let Some((name, id)) = &rollback.network {
            if let Err(e) = self.engine.remove_network(id).await {
                tracing::error!("Failed to remove network {} during rollback: {}", name, e);
                leftovers.push(NodeFailure::new(cluster, name, e));
            }
        }

        if leftovers.is_empty() {
            cause
        } else {
            ClusterError::RollbackFailure {
                cluster: cluster.to_string(),
                cause: Box::new(cause),
                leftovers,
            }
        }
    }

    /// Clusters an operation applies to; a named cluster must exist
    async fn targets(&self, all: bool, name: Option<&str>) -> Result<Vec<Cluster>> {
        let clusters = self.reader.list(all, name).await?;
        if !all && clusters.is_empty() {
            let name = name.unwrap_or(&self.settings.default_cluster_name);
            return Err(ClusterError::ClusterNotFound(name.to_string()));
        }
        if clusters.is_empty() {
            tracing::info!("No clusters found");
        }
        Ok(clusters.into_values().collect())
    }

    /// Delete one named cluster, or every cluster when `all`. Returns the
    /// names of the clusters that are gone.
    pub async fn delete(&self, all: bool, name: Option<&str>) -> Result<Vec<String>> {
        let clusters = self.reader.list(all, name).await?;
        let mut failures = Vec::new();
        let mut removed = Vec::new();

        if !all && clusters.is_empty() {
            let name = name.unwrap_or(&self.settings.default_cluster_name);
            if self.sweep_orphans(name, &mut failures).await? {
                removed.push(name.to_string());
            }
        }

        for cluster in clusters.values() {
            if self.delete_one(cluster, &mut failures).await {
                removed.push(cluster.name.clone());
            }
        }

        if all {
            for orphan in self.reader.cluster_names().await? {
                if clusters.contains_key(&orphan) {
                    continue;
                }
                match self.sweep_orphans(&orphan, &mut failures).await {
                    Ok(_) => removed.push(orphan),
                    Err(ClusterError::ClusterNotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!("Failed to look up leftovers of cluster {}: {}", orphan, e);
                        failures.push(NodeFailure::new(&orphan, &orphan, e));
                    }
                }
            }
        }

        finish("delete", failures)?;
        Ok(removed)
    }

    async fn delete_one(&self, cluster: &Cluster, failures: &mut Vec<NodeFailure>) -> bool {
        tracing::info!("Removing cluster {}", cluster.name);

        if !cluster.workers.is_empty() {
            tracing::info!("...Removing {} workers", cluster.workers.len());
        }
        for worker in &cluster.workers {
            if let Err(e) = self.engine.remove_container(&worker.id).await {
                tracing::warn!("Failed to remove worker {}: {}", worker.name, e);
                failures.push(NodeFailure::new(&cluster.name, &worker.name, e));
            }
        }

        tracing::info!("...Removing server");
        if let Err(e) = self.engine.remove_container(&cluster.server.id).await {
            tracing::error!("Failed to remove server of cluster {}: {}", cluster.name, e);
            failures.push(NodeFailure::new(&cluster.name, &cluster.server.name, e));
            return false;
        }

        if let Err(e) = self.dirs.remove(&cluster.name) {
            tracing::warn!("Failed to remove directory of cluster {}: {}", cluster.name, e);
        }
        self.remove_networks(&cluster.name).await;

        tracing::info!("Removed cluster {}", cluster.name);
        true
    }

    /// Remove what is left of a cluster whose server is gone. Returns
    /// whether anything was found.
    async fn sweep_orphans(&self, name: &str, failures: &mut Vec<NodeFailure>) -> Result<bool> {
        let containers = self.reader.containers_of(name).await?;
        let networks = self.reader.networks_of(name).await?;
        if containers.is_empty() && networks.is_empty() {
            return Err(ClusterError::ClusterNotFound(name.to_string()));
        }

        tracing::info!("Removing leftovers of cluster {}", name);
        for container in &containers {
            if let Err(e) = self.engine.remove_container(&container.id).await {
                tracing::warn!("Failed to remove {}: {}", container.name(), e);
                failures.push(NodeFailure::new(name, container.name(), e));
            }
        }

        if let Err(e) = self.dirs.remove(name) {
            tracing::warn!("Failed to remove directory of cluster {}: {}", name, e);
        }
        self.remove_networks(name).await;
        Ok(true)
    }

    async fn remove_networks(&self, cluster: &str) {
        let networks = match self.reader.networks_of(cluster).await {
            Ok(networks) => networks,
            Err(e) => {
                tracing::warn!("Couldn't find network of cluster {}: {}", cluster, e);
                return;
            }
        };
        for network in networks {
            if let Err(e) = self.engine.remove_network(&network.id).await {
                tracing::warn!("Couldn't remove network {} of cluster {}: {}", network.name, cluster, e);
            }
        }
    }

    /// Stop one named cluster, or every cluster when `all`
    pub async fn stop(&self, all: bool, name: Option<&str>) -> Result<Vec<String>> {
        let clusters = self.targets(all, name).await?;
        let mut failures = Vec::new();
        let mut stopped = Vec::new();

        for cluster in &clusters {
            tracing::info!("Stopping cluster {}", cluster.name);
            let before = failures.len();

            if !cluster.workers.is_empty() {
                tracing::info!("...Stopping {} workers", cluster.workers.len());
            }
            for worker in &cluster.workers {
                if let Err(e) = self.engine.stop_container(&worker.id).await {
                    tracing::warn!("Failed to stop worker {}: {}", worker.name, e);
                    failures.push(NodeFailure::new(&cluster.name, &worker.name, e));
                }
            }

            tracing::info!("...Stopping server");
            if let Err(e) = self.engine.stop_container(&cluster.server.id).await {
                tracing::error!("Failed to stop server of cluster {}: {}", cluster.name, e);
                failures.push(NodeFailure::new(&cluster.name, &cluster.server.name, e));
            }

            if failures.len() == before {
                tracing::info!("Stopped cluster {}", cluster.name);
                stopped.push(cluster.name.clone());
            }
        }

        finish("stop", failures)?;
        Ok(stopped)
    }

    /// Start one named cluster, or every cluster when `all`
    pub async fn start(&self, all: bool, name: Option<&str>) -> Result<Vec<String>> {
        let clusters = self.targets(all, name).await?;
        let mut failures = Vec::new();
        let mut started = Vec::new();

        for cluster in &clusters {
            tracing::info!("Starting cluster {}", cluster.name);

            tracing::info!("...Starting server");
            if let Err(e) = self.engine.start_container(&cluster.server.id).await {
                tracing::error!("Failed to start server of cluster {}: {}", cluster.name, e);
                failures.push(NodeFailure::new(&cluster.name, &cluster.server.name, e));
                continue;
            }

            let before = failures.len();
            if !cluster.workers.is_empty() {
                tracing::info!("...Starting {} workers", cluster.workers.len());
            }
            for worker in &cluster.workers {
                if let Err(e) = self.engine.start_container(&worker.id).await {
                    tracing::warn!("Failed to start worker {}: {}", worker.name, e);
                    failures.push(NodeFailure::new(&cluster.name, &worker.name, e));
                }
            }

            if failures.len() == before {
                tracing::info!("Started cluster {}", cluster.name);
                started.push(cluster.name.clone());
            }
        }

        finish("start", failures)?;
        Ok(started)
    }

    /// Copy the credentials file out of the server of `name` unless a local
    /// copy already exists, and return the local path
    pub async fn get_kubeconfig(&self, name: &str) -> Result<PathBuf> {
        let servers = self.reader.servers_of(name).await?;
        let server = match servers.as_slice() {
            [] => return Err(ClusterError::ClusterNotFound(name.to_string())),
            [server] => server,
            many => {
                return Err(ClusterError::AmbiguousServer {
                    cluster: name.to_string(),
                    count: many.len(),
                })
            }
        };

        let path = self.dirs.kubeconfig_path(name);
        if path.exists() {
            tracing::debug!("Using existing credentials at {}", path.display());
            return Ok(path);
        }

        let archive = self
            .engine
            .copy_from_container(&server.id, &self.settings.kubeconfig_path)
            .await?;
        let contents = extract_archived_file(&archive)?;

        self.dirs.create(name)?;
        std::fs::write(&path, contents)?;
        tracing::info!("Wrote credentials of cluster {} to {}", name, path.display());
        Ok(path)
    }
}

/// Apply the per-worker host port offset: base plus ordinal. A missing or
/// zero base leaves the ports alone.
fn worker_offset(ports: PublishedPortSet, base: Option<u16>, ordinal: u32) -> Result<PublishedPortSet> {
    match base {
        Some(base) if base > 0 => ports.offset(u32::from(base) + ordinal),
        _ => Ok(ports),
    }
}

fn finish(operation: &str, failures: Vec<NodeFailure>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(ClusterError::PartialFailure {
            operation: operation.to_string(),
            failures,
        })
    }
}
