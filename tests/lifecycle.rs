//! End-to-end cluster lifecycle against the in-memory engine

use k3box::cluster::{ClusterController, ClusterStatus, CreateRequest};
use k3box::config::Settings;
use k3box::engine::memory::Fault;
use k3box::engine::{ContainerEngine, LabelFilter, MemoryEngine, LABEL_APP, LABEL_CLUSTER};
use k3box::port::{PortKey, Protocol};
use k3box::ClusterError;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn controller(engine: &MemoryEngine) -> (ClusterController, TempDir) {
    let root = tempdir().unwrap();
    let settings = Settings {
        config_root: Some(root.path().to_path_buf()),
        poll_interval_ms: 5,
        ..Default::default()
    };
    let controller = ClusterController::new(Arc::new(engine.clone()), settings).unwrap();
    (controller, root)
}

fn cluster_filter(name: &str) -> LabelFilter {
    LabelFilter::new()
        .with(LABEL_APP, "k3box")
        .with(LABEL_CLUSTER, name)
}

#[tokio::test]
async fn test_workers_publish_offset_ports_and_delete_leaves_nothing() {
    let engine = MemoryEngine::new();
    let (controller, _root) = controller(&engine);

    let request = CreateRequest::new("t1")
        .workers(2)
        .publish("8080:80@workers")
        .port_auto_offset(1);
    let cluster = controller.create(&request).await.unwrap();
    assert_eq!(cluster.workers.len(), 2);

    let mut host_ports = Vec::new();
    for worker in &cluster.workers {
        let node = engine.find_by_name(&worker.name).unwrap().unwrap();
        let bindings = &node.spec.ports.bindings()[&PortKey::new(80, Protocol::Tcp)];
        host_ports.push(bindings[0].host_port.unwrap());
    }
    assert_eq!(host_ports, vec![8081, 8082]);

    let server = engine.find_by_name("k3box-t1-server").unwrap().unwrap();
    assert!(!server
        .spec
        .ports
        .bindings()
        .contains_key(&PortKey::new(80, Protocol::Tcp)));

    assert_eq!(controller.delete(false, Some("t1")).await.unwrap(), vec!["t1"]);
    assert!(engine
        .list_containers(&cluster_filter("t1"), true)
        .await
        .unwrap()
        .is_empty());
    assert!(engine
        .list_networks(&cluster_filter("t1"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_full_cycle_with_readiness_and_credentials() {
    let engine = MemoryEngine::new();
    let (controller, _root) = controller(&engine);
    engine
        .set_boot_log("k3box-dev-server", "Running kubelet --cloud-provider=external")
        .unwrap();
    engine
        .put_file("k3box-dev-server", "/output/kubeconfig.yaml", b"clusters: []\n")
        .unwrap();

    let request = CreateRequest::new("dev")
        .image("rancher/k3s:v1.29.4-k3s1")
        .workers(1)
        .wait(std::time::Duration::from_secs(5));
    let cluster = controller.create(&request).await.unwrap();
    assert!(cluster.status.is_running());
    assert_eq!(cluster.image, "docker.io/rancher/k3s:v1.29.4-k3s1");
    assert_eq!(
        engine.pulled_images().unwrap(),
        vec!["docker.io/rancher/k3s:v1.29.4-k3s1"]
    );

    let path = controller.get_kubeconfig("dev").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"clusters: []\n");

    controller.stop(false, Some("dev")).await.unwrap();
    let listed = controller.list(true, None).await.unwrap();
    assert_eq!(listed["dev"].status, ClusterStatus::Stopped);
    assert_eq!(listed["dev"].worker_summary(), "0/1");

    controller.start(false, Some("dev")).await.unwrap();
    assert!(controller.list(false, Some("dev")).await.unwrap()["dev"]
        .status
        .is_running());

    controller.delete(true, None).await.unwrap();
    assert!(!path.exists());
    assert!(engine.container_names().unwrap().is_empty());
    assert!(engine.network_names().unwrap().is_empty());
}

#[tokio::test]
async fn test_bulk_stop_reports_every_failure() {
    let engine = MemoryEngine::new();
    let (controller, _root) = controller(&engine);
    for name in ["a", "b", "c"] {
        controller
            .create(&CreateRequest::new(name).workers(1))
            .await
            .unwrap();
    }
    engine.fail(Fault::StopContainer, "k3box-a-worker-0").unwrap();
    engine.fail(Fault::StopContainer, "k3box-c-server").unwrap();

    let err = controller.stop(true, None).await.unwrap_err();
    let failures = match err {
        ClusterError::PartialFailure { failures, .. } => failures,
        other => panic!("unexpected error: {}", other),
    };
    let nodes: Vec<_> = failures.iter().map(|f| f.node.as_str()).collect();
    assert_eq!(nodes, vec!["k3box-a-worker-0", "k3box-c-server"]);

    let clusters = controller.list(true, None).await.unwrap();
    assert_eq!(clusters["a"].status, ClusterStatus::Unhealthy);
    assert_eq!(clusters["b"].status, ClusterStatus::Stopped);
    assert_eq!(clusters["c"].status, ClusterStatus::Unhealthy);
}

#[tokio::test]
async fn test_clusters_of_other_tools_are_untouched() {
    let engine = MemoryEngine::new();
    let (controller, _root) = controller(&engine);

    let other = Settings {
        app_label: "other".to_string(),
        node_prefix: "other".to_string(),
        config_root: controller.settings().config_root.clone(),
        ..Default::default()
    };
    let foreign = ClusterController::new(Arc::new(engine.clone()), other).unwrap();
    foreign.create(&CreateRequest::new("t1")).await.unwrap();

    assert!(controller.list(true, None).await.unwrap().is_empty());
    controller.create(&CreateRequest::new("t1")).await.unwrap();
    controller.delete(true, None).await.unwrap();

    assert_eq!(foreign.list(true, None).await.unwrap().len(), 1);
}
