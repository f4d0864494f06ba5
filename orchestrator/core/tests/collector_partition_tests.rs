// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Artifacts from each node land in that node's own directory.

use chrono::Local;
use netcap_core::application::collector::ArtifactCollector;
use netcap_core::domain::cluster::{ClusterClient, WorkloadSpec};
use netcap_core::domain::errors::ExperimentError;
use netcap_core::domain::events::ExperimentEvent;
use netcap_core::domain::experiment::{Agent, AgentPhase, AgentRole};
use netcap_core::domain::layout::{path_arg, WorkLayout};
use netcap_core::infrastructure::event_bus::EventBus;
use netcap_core::infrastructure::fakes::InMemoryCluster;
use netcap_core::infrastructure::result_tree::ResultTree;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const EXPERIMENT: &str = "partition";

fn layout() -> WorkLayout {
    WorkLayout::in_agent("/host", "/tmp/netcap", EXPERIMENT)
}

fn observer_spec(node: &str) -> WorkloadSpec {
    let name = format!("{}-observer-{}", EXPERIMENT, node);
    WorkloadSpec {
        readiness_check: vec![
            "test".to_string(),
            "-f".to_string(),
            path_arg(&layout().ready_marker(&name)),
        ],
        name,
        namespace: EXPERIMENT.to_string(),
        node: node.to_string(),
        image: "img".to_string(),
        command: vec!["sleep".to_string(), "infinity".to_string()],
        env: BTreeMap::new(),
        labels: BTreeMap::new(),
        privileged: true,
        host_network: true,
        host_pid: true,
        host_mount: None,
        service_account: None,
    }
}

/// Host-side artifact directory of `node` in the fake cluster.
fn artifact_dir(cluster: &InMemoryCluster, node: &str) -> PathBuf {
    cluster.host_path(node, layout().artifact_dir())
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

async fn setup(nodes: &[&str]) -> (tempfile::TempDir, Arc<InMemoryCluster>, Vec<Agent>) {
    let dir = tempfile::tempdir().unwrap();
    let mut cluster = InMemoryCluster::new(dir.path().join("cluster")).with_namespace(EXPERIMENT);
    for node in nodes {
        cluster = cluster.with_node(node, true);
    }
    let cluster = Arc::new(cluster);

    let mut observers = Vec::new();
    for node in nodes {
        let workload = cluster.create_workload(&observer_spec(node)).await.unwrap();
        let artifacts = artifact_dir(&cluster, node);
        write(&artifacts.join("observer.log"), &format!("observer on {}\n", node));
        write(&artifacts.join("observer-br-ex.pcap"), node);
        observers.push(Agent::new(AgentRole::Observer, *node, workload));
    }
    (dir, cluster, observers)
}

fn collector(cluster: Arc<InMemoryCluster>, tree: ResultTree, bus: EventBus) -> ArtifactCollector {
    ArtifactCollector::new(
        cluster,
        tree,
        layout(),
        Duration::from_millis(10),
        Duration::from_millis(200),
        bus,
    )
}

#[tokio::test]
async fn test_same_file_names_stay_partitioned_by_node() {
    let (dir, cluster, mut observers) = setup(&["worker-1", "worker-2"]).await;
    write(
        &artifact_dir(&cluster, "worker-1").join("producer.log"),
        "producer\n",
    );
    write(
        &artifact_dir(&cluster, "worker-2").join("consumer.log"),
        "consumer\n",
    );

    let tree = ResultTree::create(&dir.path().join("results"), EXPERIMENT, Local::now()).unwrap();
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let collector = collector(cluster.clone(), tree.clone(), bus);

    for observer in observers.iter_mut() {
        let collected = collector.collect(observer).await.unwrap();
        assert_eq!(collected.dir, tree.node_dir(&observer.node));
        assert_eq!(observer.phase, AgentPhase::Done);
    }

    for node in ["worker-1", "worker-2"] {
        let log = std::fs::read_to_string(tree.node_dir(node).join("observer.log")).unwrap();
        assert_eq!(log, format!("observer on {}\n", node));
        let pcap = std::fs::read_to_string(tree.node_dir(node).join("observer-br-ex.pcap")).unwrap();
        assert_eq!(pcap, node);
    }
    assert!(tree.node_dir("worker-1").join("producer.log").is_file());
    assert!(!tree.node_dir("worker-1").join("consumer.log").exists());
    assert!(tree.node_dir("worker-2").join("consumer.log").is_file());
    assert!(!tree.node_dir("worker-2").join("producer.log").exists());

    let collected: Vec<String> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ExperimentEvent::ArtifactsCollected { node, .. } => Some(node),
            _ => None,
        })
        .collect();
    assert_eq!(collected, vec!["worker-1", "worker-2"]);
}

#[tokio::test]
async fn test_node_is_never_collected_twice() {
    let (dir, cluster, mut observers) = setup(&["worker-1"]).await;
    let tree = ResultTree::create(&dir.path().join("results"), EXPERIMENT, Local::now()).unwrap();
    let collector = collector(cluster, tree.clone(), EventBus::default());

    collector.collect(&mut observers[0]).await.unwrap();
    let err = collector.collect(&mut observers[0]).await.unwrap_err();
    assert!(matches!(&err, ExperimentError::Collection { node, .. } if node == "worker-1"));
    assert!(tree.node_dir("worker-1").join("observer.log").is_file());
}

#[tokio::test]
async fn test_missing_artifact_directory_is_reported() {
    let (dir, cluster, mut observers) = setup(&["worker-1"]).await;
    std::fs::remove_dir_all(artifact_dir(&cluster, "worker-1")).unwrap();

    let tree = ResultTree::create(&dir.path().join("results"), EXPERIMENT, Local::now()).unwrap();
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let collector = collector(cluster, tree.clone(), bus);

    let err = collector.collect(&mut observers[0]).await.unwrap_err();
    assert!(matches!(err, ExperimentError::Collection { .. }));
    assert!(!err.is_fatal());
    assert!(!tree.node_dir("worker-1").exists());
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, ExperimentEvent::CollectionFailed { .. })));
}

#[tokio::test]
async fn test_still_ready_observer_is_collected_after_timeout() {
    let (dir, cluster, mut observers) = setup(&["worker-1"]).await;
    let ready = cluster.host_path("worker-1", layout().ready_marker(&observers[0].name));
    write(&ready, "");

    let tree = ResultTree::create(&dir.path().join("results"), EXPERIMENT, Local::now()).unwrap();
    let collector = collector(cluster, tree.clone(), EventBus::default());

    let started = std::time::Instant::now();
    collector.collect(&mut observers[0]).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_ne!(observers[0].phase, AgentPhase::Done);
    assert!(tree.node_dir("worker-1").join("observer.log").is_file());
}
