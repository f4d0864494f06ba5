// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

#![allow(dead_code)]

use async_trait::async_trait;
use netcap_core::application::agent_runtime::AgentRuntime;
use netcap_core::domain::cluster::WorkloadSpec;
use netcap_core::domain::config::{AgentSettings, ExperimentConfigManifest};
use netcap_core::domain::experiment::AgentRole;
use netcap_core::domain::link::LinkResolver;
use netcap_core::infrastructure::fakes::{
    InMemoryCluster, RecordingCaptureLauncher, StaticLinkResolver, WorkloadDriver,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const PRODUCER_LINK: u32 = 17;
pub const CONSUMER_LINK: u32 = 23;
pub const PRODUCER_VETH: &str = "veth-p";
pub const CONSUMER_VETH: &str = "veth-c";
pub const HOST_DEFAULT_ROUTE: &str = "br-ex";

/// Runs the real agent runtime for every workload the fake cluster
/// starts, against that node's directory.
pub struct AgentDriver {
    pub host_mount: String,
    pub captures: RecordingCaptureLauncher,
}

impl AgentDriver {
    pub fn new(host_mount: &str) -> Self {
        Self {
            host_mount: host_mount.to_string(),
            captures: RecordingCaptureLauncher::new(),
        }
    }

    fn links_for(settings: &AgentSettings) -> StaticLinkResolver {
        match settings.role {
            AgentRole::Producer => StaticLinkResolver::new(&settings.pod_interface)
                .with_link(&settings.pod_interface, PRODUCER_LINK),
            AgentRole::Consumer => StaticLinkResolver::new(&settings.pod_interface)
                .with_link(&settings.pod_interface, CONSUMER_LINK),
            AgentRole::Observer => StaticLinkResolver::new(HOST_DEFAULT_ROUTE)
                .with_interface(&settings.tunnel_interface)
                .with_host_interface(PRODUCER_LINK, PRODUCER_VETH)
                .with_host_interface(CONSUMER_LINK, CONSUMER_VETH),
        }
    }
}

#[async_trait]
impl WorkloadDriver for AgentDriver {
    async fn run(&self, node_root: PathBuf, spec: WorkloadSpec) -> Result<(), String> {
        let value = spec
            .env
            .get(AgentSettings::ENV)
            .ok_or_else(|| format!("{} not set", AgentSettings::ENV))?;
        let mut settings = AgentSettings::from_env_value(value).map_err(|e| e.to_string())?;
        let relative = settings
            .work_dir
            .strip_prefix(&self.host_mount)
            .map_err(|e| e.to_string())?
            .to_path_buf();
        settings.work_dir = node_root.join(relative);

        let links: Arc<dyn LinkResolver> = Arc::new(Self::links_for(&settings));
        AgentRuntime::for_settings(settings, links, Arc::new(self.captures.clone()))
            .run()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Fast timings; `result_dir` is where result trees land.
pub fn test_config(namespace: &str, result_dir: &Path) -> ExperimentConfigManifest {
    let mut config = ExperimentConfigManifest::default();
    let spec = &mut config.spec;
    spec.namespace = namespace.to_string();
    spec.duration = Duration::from_secs(1);
    spec.agent_image = "quay.io/netcap/agent:test".to_string();
    spec.paths.result_dir = result_dir.to_path_buf();
    spec.capture.service_port = free_port();
    spec.timing.readiness_timeout = Duration::from_secs(10);
    spec.timing.poll_interval = Duration::from_millis(20);
    spec.timing.signal_poll_interval = Duration::from_millis(20);
    spec.timing.request_interval = Duration::from_millis(200);
    spec.timing.request_timeout = Duration::from_secs(1);
    spec.timing.collection_timeout = Duration::from_secs(10);
    spec.timing.drain_timeout = Duration::from_secs(1);
    config
}

/// Fake cluster with `nodes` Ready, driving real agents.
pub fn cluster_with_agents(root: &Path, nodes: &[&str]) -> (Arc<InMemoryCluster>, Arc<AgentDriver>) {
    let driver = Arc::new(AgentDriver::new("/host"));
    let mut cluster = InMemoryCluster::new(root).with_driver(driver.clone());
    for node in nodes {
        cluster = cluster.with_node(node, true);
    }
    (Arc::new(cluster), driver)
}

/// Files under `dir`, relative and sorted.
pub fn list_files(dir: &Path) -> Vec<String> {
    fn walk(base: &Path, dir: &Path, out: &mut Vec<String>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                out.push(path.strip_prefix(base).unwrap().to_string_lossy().into_owned());
            }
        }
    }
    let mut out = Vec::new();
    walk(dir, dir, &mut out);
    out.sort();
    out
}
