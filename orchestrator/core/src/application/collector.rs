// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-node artifact collection.
//!
//! One Observer per node owns the node's artifact directory. Once it has
//! finished (no longer Ready), the directory is streamed out as a tar archive
//! through exec and unpacked into that node's slot of the result tree.

use crate::domain::cluster::ClusterClient;
use crate::domain::errors::ExperimentError;
use crate::domain::events::ExperimentEvent;
use crate::domain::experiment::{Agent, AgentPhase};
use crate::domain::layout::{path_arg, WorkLayout};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::result_tree::ResultTree;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const KEEPALIVE_PID_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct CollectedArtifacts {
    pub node: String,
    pub dir: PathBuf,
    /// Paths relative to `dir`
    pub files: Vec<PathBuf>,
}

pub struct ArtifactCollector {
    cluster: Arc<dyn ClusterClient>,
    tree: ResultTree,
    layout: WorkLayout,
    poll_interval: Duration,
    timeout: Duration,
    event_bus: EventBus,
}

impl ArtifactCollector {
    /// `layout` is the work layout as seen from inside the agents.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        tree: ResultTree,
        layout: WorkLayout,
        poll_interval: Duration,
        timeout: Duration,
        event_bus: EventBus,
    ) -> Self {
        Self {
            cluster,
            tree,
            layout,
            poll_interval,
            timeout,
            event_bus,
        }
    }

    pub fn tree(&self) -> &ResultTree {
        &self.tree
    }

    /// Collect the artifacts of `observer`'s node. Errors are non-fatal
    /// [`ExperimentError::Collection`]s.
    pub async fn collect(&self, observer: &mut Agent) -> Result<CollectedArtifacts, ExperimentError> {
        let node = observer.node.clone();
        let result = self.try_collect(observer).await;
        match &result {
            Ok(collected) => {
                metrics::counter!("netcap_collections_total", "outcome" => "collected").increment(1);
                self.event_bus.publish(ExperimentEvent::ArtifactsCollected {
                    node: node.clone(),
                    files: collected.files.len(),
                    collected_at: Utc::now(),
                });
                self.release(observer).await;
            }
            Err(e) => {
                metrics::counter!("netcap_collections_total", "outcome" => "failed").increment(1);
                warn!("{}", e);
                self.event_bus.publish(ExperimentEvent::CollectionFailed {
                    node,
                    reason: e.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
        result
    }

    async fn try_collect(&self, observer: &mut Agent) -> Result<CollectedArtifacts, ExperimentError> {
        let node = observer.node.clone();
        let failed = |reason: String| ExperimentError::Collection {
            node: node.clone(),
            reason,
        };

        self.wait_finished(observer).await;

        let command = vec![
            "tar".to_string(),
            "-C".to_string(),
            path_arg(&self.layout.artifact_dir()),
            "-cf".to_string(),
            "-".to_string(),
            ".".to_string(),
        ];
        let output = self
            .cluster
            .exec(&observer.workload, &command)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.success() {
            return Err(failed(format!(
                "archive exited {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        debug!("Received {} bytes of artifacts from {}", output.stdout.len(), node);

        let tree = self.tree.clone();
        let unpack_node = node.clone();
        let files = tokio::task::spawn_blocking(move || tree.unpack_node(&unpack_node, &output.stdout))
            .await
            .map_err(|e| failed(e.to_string()))?
            .map_err(|e| failed(e.to_string()))?;

        info!("Collected {} files from {}", files.len(), node);
        Ok(CollectedArtifacts {
            dir: self.tree.node_dir(&node),
            node,
            files,
        })
    }

    /// Wait for the Observer to drop its readiness marker. On timeout the
    /// collection proceeds with whatever is on the node.
    async fn wait_finished(&self, observer: &mut Agent) {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            match self.cluster.workload_status(&observer.workload).await {
                Ok(status) if !status.ready || status.phase.is_terminal() => {
                    observer.observe_phase(AgentPhase::Done);
                    self.event_bus.publish(ExperimentEvent::AgentFinished {
                        agent: observer.name.clone(),
                        node: observer.node.clone(),
                        finished_at: Utc::now(),
                    });
                    return;
                }
                Ok(_) => {}
                Err(e) => debug!("Status of {} unavailable: {}", observer.name, e),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    "Observer {} still running after {:?}; collecting anyway",
                    observer.name, self.timeout
                );
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Best effort: end the Observer's keep-alive by its recorded pid. The
    /// Observer sees the host's process table, so nothing is matched by name.
    pub async fn release(&self, observer: &Agent) {
        let pid = match self.keepalive_pid(observer).await {
            Some(pid) => pid,
            None => {
                debug!("No keep-alive pid recorded for {}", observer.name);
                return;
            }
        };
        let command = vec!["kill".to_string(), "-TERM".to_string(), pid.to_string()];
        match self.cluster.exec(&observer.workload, &command).await {
            Ok(output) if output.success() => {
                debug!("Released keep-alive {} of {}", pid, observer.name)
            }
            Ok(output) => debug!(
                "Keep-alive release in {} exited {}",
                observer.name, output.exit_code
            ),
            Err(e) => debug!("Keep-alive release in {} failed: {}", observer.name, e),
        }
    }

    /// The wrapper writes the pid right after the agent exits, so give it a
    /// few polls to appear.
    async fn keepalive_pid(&self, observer: &Agent) -> Option<u32> {
        let command = vec![
            "cat".to_string(),
            path_arg(&self.layout.keepalive_pid(&observer.name)),
        ];
        for attempt in 1..=KEEPALIVE_PID_ATTEMPTS {
            if let Ok(output) = self.cluster.exec(&observer.workload, &command).await {
                if output.success() {
                    if let Ok(pid) = String::from_utf8_lossy(&output.stdout).trim().parse::<u32>() {
                        return Some(pid);
                    }
                }
            }
            if attempt < KEEPALIVE_PID_ATTEMPTS {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::WorkloadSpec;
    use crate::domain::experiment::AgentRole;
    use crate::infrastructure::fakes::InMemoryCluster;
    use chrono::Local;
    use std::collections::BTreeMap;

    fn kept_alive_observer(namespace: &str, node: &str) -> WorkloadSpec {
        let name = format!("{}-observer-{}", namespace, node);
        WorkloadSpec {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "netcap agent run; sleep infinity & echo $! > /host/tmp/netcap/{}/signals/{}/keepalive.pid; wait",
                    namespace, name
                ),
            ],
            name,
            namespace: namespace.to_string(),
            node: node.to_string(),
            image: "img".to_string(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            privileged: true,
            host_network: true,
            host_pid: true,
            host_mount: None,
            readiness_check: vec![],
            service_account: None,
        }
    }

    #[tokio::test]
    async fn test_release_signals_only_the_recorded_keepalive() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(
            InMemoryCluster::new(dir.path().join("nodes"))
                .with_node("worker-1", true)
                .with_namespace("exp-a")
                .with_namespace("exp-b"),
        );
        // Two experiments' Observers share the node's process table.
        let (mine, my_pid) = cluster
            .create_kept_alive(&kept_alive_observer("exp-a", "worker-1"))
            .await
            .unwrap();
        let (theirs, _) = cluster
            .create_kept_alive(&kept_alive_observer("exp-b", "worker-1"))
            .await
            .unwrap();

        let tree = ResultTree::create(&dir.path().join("results"), "exp-a", Local::now()).unwrap();
        let collector = ArtifactCollector::new(
            cluster.clone(),
            tree,
            WorkLayout::in_agent("/host", "/tmp/netcap", "exp-a"),
            Duration::from_millis(5),
            Duration::from_secs(1),
            EventBus::default(),
        );
        collector
            .release(&Agent::new(AgentRole::Observer, "worker-1", mine.clone()))
            .await;

        assert!(!cluster.is_kept_alive(&mine));
        assert!(cluster.is_kept_alive(&theirs), "other experiment's keep-alive untouched");

        let kills: Vec<Vec<String>> = cluster
            .exec_log()
            .into_iter()
            .map(|(_, command)| command)
            .filter(|command| command.first().map(String::as_str) != Some("cat"))
            .collect();
        assert_eq!(
            kills,
            vec![vec!["kill".to_string(), "-TERM".to_string(), my_pid.to_string()]]
        );
    }

    #[tokio::test]
    async fn test_release_without_recorded_pid_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(
            InMemoryCluster::new(dir.path().join("nodes"))
                .with_node("worker-1", true)
                .with_namespace("exp-a"),
        );
        let mut spec = kept_alive_observer("exp-a", "worker-1");
        spec.command = vec!["netcap".to_string(), "agent".to_string(), "run".to_string()];
        let (workload, _) = cluster.create_kept_alive(&spec).await.unwrap();

        let tree = ResultTree::create(&dir.path().join("results"), "exp-a", Local::now()).unwrap();
        let collector = ArtifactCollector::new(
            cluster.clone(),
            tree,
            WorkLayout::in_agent("/host", "/tmp/netcap", "exp-a"),
            Duration::from_millis(1),
            Duration::from_secs(1),
            EventBus::default(),
        );
        collector
            .release(&Agent::new(AgentRole::Observer, "worker-1", workload.clone()))
            .await;

        assert!(cluster.is_kept_alive(&workload));
        assert!(cluster
            .exec_log()
            .iter()
            .all(|(_, command)| command[0] == "cat"));
    }
}
