//! Cluster state reader
//!
//! Clusters are reassembled from labelled containers on every call. Servers
//! are listed first; each server found pulls in the workers carrying the
//! same cluster label.

use super::model::{cluster_status, Cluster, Node};
use super::naming::{parse_node_name, NodeRole};
use crate::config::Settings;
use crate::engine::{
    ContainerEngine, ContainerSummary, LabelFilter, NetworkSummary, LABEL_APP, LABEL_CLUSTER,
    LABEL_COMPONENT,
};
use crate::error::{ClusterError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Reads clusters back from the engine
#[derive(Clone)]
pub struct StateReader {
    engine: Arc<dyn ContainerEngine>,
    app_label: String,
    node_prefix: String,
}

impl StateReader {
    pub fn new(engine: Arc<dyn ContainerEngine>, settings: &Settings) -> Self {
        Self {
            engine,
            app_label: settings.app_label.clone(),
            node_prefix: settings.node_prefix.clone(),
        }
    }

    fn app_filter(&self) -> LabelFilter {
        LabelFilter::new().with(LABEL_APP, &self.app_label)
    }

    /// Every cluster when `all`, otherwise at most the cluster called `name`
    pub async fn list(&self, all: bool, name: Option<&str>) -> Result<BTreeMap<String, Cluster>> {
        let mut filter = self.app_filter().with(LABEL_COMPONENT, NodeRole::Server.as_str());
        if !all {
            match name {
                Some(name) => filter = filter.with(LABEL_CLUSTER, name),
                None => return Ok(BTreeMap::new()),
            }
        }

        let servers = self.engine.list_containers(&filter, true).await?;
        let mut clusters = BTreeMap::new();

        for server in servers {
            let cluster_name = match server.label(LABEL_CLUSTER) {
                Some(n) => n.to_string(),
                None => {
                    tracing::warn!("Server container {} carries no cluster label", server.name());
                    continue;
                }
            };

            if clusters.contains_key(&cluster_name) {
                tracing::warn!(
                    "Cluster {} has more than one server, ignoring {}",
                    cluster_name,
                    server.name()
                );
                continue;
            }

            let workers = self.workers_of(&cluster_name).await?;
            let cluster = self.assemble(&cluster_name, &server, &workers);
            clusters.insert(cluster_name, cluster);
        }

        Ok(clusters)
    }

    /// The cluster called `name`
    pub async fn get(&self, name: &str) -> Result<Cluster> {
        self.list(false, Some(name))
            .await?
            .remove(name)
            .ok_or_else(|| ClusterError::ClusterNotFound(name.to_string()))
    }

    /// Server containers of `name`, stopped ones included
    pub async fn servers_of(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        let filter = self
            .app_filter()
            .with(LABEL_CLUSTER, name)
            .with(LABEL_COMPONENT, NodeRole::Server.as_str());
        self.engine.list_containers(&filter, true).await
    }

    /// Worker containers of `name`, stopped ones included
    pub async fn workers_of(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        let filter = self
            .app_filter()
            .with(LABEL_CLUSTER, name)
            .with(LABEL_COMPONENT, NodeRole::Worker.as_str());
        self.engine.list_containers(&filter, true).await
    }

    /// Every container labelled with cluster `name`, whatever its role
    pub async fn containers_of(&self, name: &str) -> Result<Vec<ContainerSummary>> {
        let filter = self.app_filter().with(LABEL_CLUSTER, name);
        self.engine.list_containers(&filter, true).await
    }

    /// Every cluster name found on a labelled container or network, whether
    /// or not its server still exists
    pub async fn cluster_names(&self) -> Result<BTreeSet<String>> {
        let filter = self.app_filter();
        let mut names: BTreeSet<String> = self
            .engine
            .list_containers(&filter, true)
            .await?
            .iter()
            .filter_map(|c| c.label(LABEL_CLUSTER).map(str::to_string))
            .collect();
        names.extend(
            self.engine
                .list_networks(&filter)
                .await?
                .into_iter()
                .filter_map(|mut n| n.labels.remove(LABEL_CLUSTER)),
        );
        Ok(names)
    }

    /// Networks labelled with cluster `name`
    pub async fn networks_of(&self, name: &str) -> Result<Vec<NetworkSummary>> {
        let filter = self.app_filter().with(LABEL_CLUSTER, name);
        self.engine.list_networks(&filter).await
    }

    fn assemble(&self, name: &str, server: &ContainerSummary, workers: &[ContainerSummary]) -> Cluster {
        let server_node = Node::from_summary(server, NodeRole::Server, None);

        let mut worker_nodes: Vec<Node> = workers
            .iter()
            .map(|w| {
                let ordinal = parse_node_name(&self.node_prefix, name, w.name())
                    .and_then(|slot| slot.ordinal());
                Node::from_summary(w, NodeRole::Worker, ordinal)
            })
            .collect();
        worker_nodes.sort_by(|a, b| match (a.ordinal, b.ordinal) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        });

        let worker_states: Vec<_> = worker_nodes.iter().map(|w| w.state.clone()).collect();
        let status = cluster_status(&server_node.state, &worker_states);

        let mut server_ports: Vec<u16> = server.ports.iter().filter_map(|p| p.public_port).collect();
        server_ports.sort_unstable();
        server_ports.dedup();

        Cluster {
            name: name.to_string(),
            image: server.image.clone(),
            status,
            server_ports,
            server: server_node,
            workers: worker_nodes,
        }
    }
}
