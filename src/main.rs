//! k3box - disposable multi-node k3s clusters
//!
//! This is the main CLI entry point for k3box.

use clap::{Parser, Subcommand};
use k3box::cluster::{wait_policy, Cluster, ClusterController, CreateRequest};
use k3box::config::Settings;
use k3box::engine::DockerEngine;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// k3box - multi-node k3s clusters as containers
#[derive(Parser)]
#[command(name = "k3box")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Run disposable multi-node k3s clusters on a local container engine", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Stream image pull progress
    #[arg(long, global = true)]
    verbose: bool,

    /// Settings file (defaults to ~/.config/k3box/config.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the container engine is reachable
    #[command(alias = "ct")]
    CheckEngine,

    /// Create a cluster
    #[command(alias = "c")]
    Create {
        /// Cluster name
        #[arg(short, long)]
        name: Option<String>,
        /// Image for every node
        #[arg(short, long)]
        image: Option<String>,
        /// Port rule `[ip:][host-port:]container-port[/proto][@selector...]`
        #[arg(short, long)]
        publish: Vec<String>,
        /// Bind mount for every node
        #[arg(short, long)]
        volume: Vec<String>,
        /// Number of workers
        #[arg(short, long, default_value = "0")]
        workers: u32,
        /// Extra server environment variable (KEY=value)
        #[arg(short, long)]
        env: Vec<String>,
        /// Extra server argument
        #[arg(short = 'x', long = "server-arg", allow_hyphen_values = true)]
        server_arg: Vec<String>,
        /// Port the API server listens on
        #[arg(long)]
        api_port: Option<u16>,
        /// Wait for the server to become ready
        #[arg(long)]
        wait: bool,
        /// Seconds to wait before giving up (0 waits forever); needs --wait
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Shift worker host ports by this base plus the worker ordinal
        #[arg(long)]
        port_auto_offset: Option<u16>,
    },

    /// Delete clusters
    #[command(alias = "d")]
    Delete {
        /// Cluster name
        #[arg(short, long)]
        name: Option<String>,
        /// Every cluster
        #[arg(short, long)]
        all: bool,
    },

    /// Stop clusters
    Stop {
        /// Cluster name
        #[arg(short, long)]
        name: Option<String>,
        /// Every cluster
        #[arg(short, long)]
        all: bool,
    },

    /// Start stopped clusters
    Start {
        /// Cluster name
        #[arg(short, long)]
        name: Option<String>,
        /// Every cluster
        #[arg(short, long)]
        all: bool,
    },

    /// List clusters
    #[command(alias = "ls")]
    List {
        /// Include clusters that are not running
        #[arg(short, long)]
        all: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the path of a cluster's kubeconfig, extracting it first if needed
    GetKubeconfig {
        /// Cluster name
        #[arg(short, long)]
        name: Option<String>,
    },
}

/// Clusters `list` shows: running ones, or every one with `--all`
fn visible_clusters(clusters: &BTreeMap<String, Cluster>, all: bool) -> Vec<&Cluster> {
    clusters
        .values()
        .filter(|c| all || c.status.is_running())
        .collect()
}

fn print_clusters(clusters: &[&Cluster]) {
    println!(
        "{:<20} {:<36} {:<12} {:<10} {:<20}",
        "NAME", "IMAGE", "STATUS", "WORKERS", "PORTS"
    );
    for c in clusters {
        let ports = c
            .server_ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<20} {:<36} {:<12} {:<10} {:<20}",
            c.name,
            c.image,
            c.status.to_string(),
            c.worker_summary(),
            ports
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Flag conflicts are rejected before the engine is contacted
    if let Commands::Create { wait, timeout, .. } = &cli.command {
        wait_policy(*wait, *timeout)?;
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let default_name = settings.default_cluster_name.clone();

    let engine = Arc::new(DockerEngine::connect().await?);
    let controller = ClusterController::new(engine, settings)?;

    match cli.command {
        Commands::CheckEngine => {
            let version = controller.check_engine().await?;
            println!("Container engine is up (API: v{})", version);
        }

        Commands::Create {
            name,
            image,
            publish,
            volume,
            workers,
            env,
            server_arg,
            api_port,
            wait,
            timeout,
            port_auto_offset,
        } => {
            let name = name.unwrap_or(default_name);
            let request = CreateRequest {
                name: name.clone(),
                image,
                publish,
                volumes: volume,
                workers,
                env,
                server_args: server_arg,
                api_port,
                wait: wait_policy(wait, timeout)?,
                port_auto_offset,
                verbose: cli.verbose,
            };

            let cluster = controller.create(&request).await?;
            println!("Created cluster {} ({})", cluster.name, cluster.status);
            println!(
                "You can now use the cluster with:\n\n  export KUBECONFIG=\"$(k3box get-kubeconfig --name='{}')\"\n  kubectl cluster-info",
                name
            );
        }

        Commands::Delete { name, all } => {
            let name = name.unwrap_or(default_name);
            for removed in controller.delete(all, Some(name.as_str())).await? {
                println!("Removed cluster {}", removed);
            }
        }

        Commands::Stop { name, all } => {
            let name = name.unwrap_or(default_name);
            for stopped in controller.stop(all, Some(name.as_str())).await? {
                println!("Stopped cluster {}", stopped);
            }
        }

        Commands::Start { name, all } => {
            let name = name.unwrap_or(default_name);
            for started in controller.start(all, Some(name.as_str())).await? {
                println!("Started cluster {}", started);
            }
        }

        Commands::List { all, json } => {
            let clusters = controller.list(true, None).await?;
            let shown = visible_clusters(&clusters, all);

            if json {
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else if shown.is_empty() {
                println!("No clusters found");
            } else {
                print_clusters(&shown);
            }
        }

        Commands::GetKubeconfig { name } => {
            let name = name.unwrap_or(default_name);
            let path = controller.get_kubeconfig(&name).await?;
            println!("{}", path.display());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k3box::cluster::{cluster_status, ContainerState, Node, NodeRole};

    fn cluster(name: &str, state: ContainerState) -> Cluster {
        Cluster {
            name: name.to_string(),
            image: "docker.io/rancher/k3s:v1".to_string(),
            status: cluster_status(&state, &[]),
            server_ports: vec![6443],
            server: Node {
                id: format!("{}-id", name),
                name: format!("k3box-{}-server", name),
                role: NodeRole::Server,
                ordinal: None,
                state,
                ports: Vec::new(),
                created: None,
            },
            workers: Vec::new(),
        }
    }

    #[test]
    fn test_stopped_clusters_are_hidden_without_all() {
        let mut clusters = BTreeMap::new();
        clusters.insert("t1".to_string(), cluster("t1", ContainerState::Exited));

        assert!(visible_clusters(&clusters, false).is_empty());
        assert_eq!(visible_clusters(&clusters, true).len(), 1);

        clusters.insert("t2".to_string(), cluster("t2", ContainerState::Running));
        let shown: Vec<_> = visible_clusters(&clusters, false)
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(shown, vec!["t2"]);
    }
}
