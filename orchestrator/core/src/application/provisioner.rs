// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent provisioning.
//!
//! Launch order is fixed: Producer (and its address), Consumer, then one
//! Observer per distinct node once both link markers exist. Any failure is
//! fatal and nothing is rolled back; workloads created so far are returned
//! to the caller for reporting and optional cleanup.

use crate::domain::cluster::{ClusterClient, ClusterError, HostMount, WorkloadSpec, WorkloadStatus};
use crate::domain::config::{AgentSettings, ExperimentConfigManifest};
use crate::domain::errors::ExperimentError;
use crate::domain::events::ExperimentEvent;
use crate::domain::experiment::{workload_name, Agent, AgentPhase, AgentRole, Experiment};
use crate::domain::layout::path_arg;
use crate::infrastructure::event_bus::EventBus;
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LABEL_EXPERIMENT: &str = "netcap.io/experiment";
pub const LABEL_ROLE: &str = "netcap.io/role";
pub const LABEL_NODE: &str = "netcap.io/node";

const HOST_ROOT: &str = "/";

/// Quote `args` for `sh -c`.
pub fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
            {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct AgentProvisioner {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<ExperimentConfigManifest>,
    event_bus: EventBus,
}

impl AgentProvisioner {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        config: Arc<ExperimentConfigManifest>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            cluster,
            config,
            event_bus,
        }
    }

    /// Settings for one agent of `experiment`.
    pub fn settings_for(&self, experiment: &Experiment, role: AgentRole, node: &str) -> AgentSettings {
        let name = experiment.workload_name(role, node);
        let mut settings = self.config.agent_settings(&name, role, node);
        settings.experiment = experiment.name.clone();
        settings
    }

    pub fn workload_spec(
        &self,
        experiment: &Experiment,
        role: AgentRole,
        node: &str,
        settings: &AgentSettings,
    ) -> Result<WorkloadSpec, ExperimentError> {
        let spec = &self.config.spec;
        let name = experiment.workload_name(role, node);
        let layout = self.config.agent_layout();

        let agent_command = vec![
            spec.capture.agent_binary.clone(),
            "agent".to_string(),
            "run".to_string(),
        ];
        let command = if role.uses_host_network() {
            // Keep the Observer's container alive after Done so its
            // artifacts can still be pulled through exec. The Observer shares
            // the host PID namespace, so the keep-alive records its own pid
            // and is released by that pid only.
            let pid_file = path_arg(&layout.keepalive_pid(&name));
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!(
                    "{}; sleep infinity & echo $! > {}; wait",
                    shell_join(&agent_command),
                    shell_join(&[pid_file])
                ),
            ]
        } else {
            agent_command
        };

        let env_value = settings.to_env_value().map_err(|e| ExperimentError::Provisioning {
            role,
            node: node.to_string(),
            reason: format!("cannot encode agent settings: {}", e),
        })?;

        Ok(WorkloadSpec {
            name: name.clone(),
            namespace: experiment.name.clone(),
            node: node.to_string(),
            image: experiment.agent_image.clone(),
            command,
            env: BTreeMap::from([(AgentSettings::ENV.to_string(), env_value)]),
            labels: BTreeMap::from([
                (LABEL_EXPERIMENT.to_string(), experiment.name.clone()),
                (LABEL_ROLE.to_string(), role.to_string()),
                (LABEL_NODE.to_string(), workload_name(&[node])),
            ]),
            privileged: true,
            host_network: role.uses_host_network(),
            host_pid: role.uses_host_network(),
            host_mount: Some(HostMount {
                host_path: HOST_ROOT.to_string(),
                mount_path: spec.paths.host_mount.clone(),
            }),
            readiness_check: vec![
                "test".to_string(),
                "-f".to_string(),
                path_arg(&layout.ready_marker(&name)),
            ],
            service_account: Some(spec.cluster.service_account.clone()),
        })
    }

    /// Submit one agent workload pinned to `node`.
    pub async fn launch(
        &self,
        role: AgentRole,
        node: &str,
        experiment: &Experiment,
        settings: AgentSettings,
    ) -> Result<Agent, ExperimentError> {
        let spec = self.workload_spec(experiment, role, node, &settings)?;
        let workload = match self.cluster.create_workload(&spec).await {
            Ok(workload) => workload,
            Err(e) => {
                metrics::counter!("netcap_agents_provisioned_total", "role" => role.as_str(), "outcome" => "failed")
                    .increment(1);
                return Err(ExperimentError::Provisioning {
                    role,
                    node: node.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        metrics::counter!("netcap_agents_provisioned_total", "role" => role.as_str(), "outcome" => "created")
            .increment(1);

        let agent = Agent::new(role, node, workload);
        info!("Launched {} agent {} on {}", role, agent.name, node);
        self.event_bus.publish(ExperimentEvent::AgentLaunched {
            agent: agent.name.clone(),
            role,
            node: node.to_string(),
            launched_at: agent.launched_at,
        });
        Ok(agent)
    }

    /// Wait until the agent reports Ready, failing fast if its workload
    /// terminates first.
    pub async fn await_ready(
        &self,
        agent: &mut Agent,
        timeout: Duration,
    ) -> Result<WorkloadStatus, ExperimentError> {
        let interval = self.config.spec.timing.poll_interval;
        let status = match self.cluster.wait_ready(&agent.workload, timeout, interval).await {
            Ok(status) => status,
            Err(ClusterError::Timeout(_)) => {
                return Err(ExperimentError::ReadinessTimeout {
                    agent: agent.name.clone(),
                    timeout,
                })
            }
            Err(e) => {
                return Err(ExperimentError::Provisioning {
                    role: agent.role,
                    node: agent.node.clone(),
                    reason: e.to_string(),
                })
            }
        };

        agent.observe_phase(AgentPhase::AwaitStart);
        debug!("Agent {} is Ready", agent.name);
        self.event_bus.publish(ExperimentEvent::AgentReady {
            agent: agent.name.clone(),
            address: status.address.clone(),
            ready_at: Utc::now(),
        });
        Ok(status)
    }

    /// Wait for a Producer/Consumer's link-index marker.
    pub async fn await_link_marker(&self, agent: &Agent) -> Result<(), ExperimentError> {
        let marker = self.config.agent_layout().link_marker(agent.role);
        let command = vec!["test".to_string(), "-f".to_string(), path_arg(&marker)];
        let timing = &self.config.spec.timing;
        let deadline = tokio::time::Instant::now() + timing.readiness_timeout;
        loop {
            match self.cluster.exec(&agent.workload, &command).await {
                Ok(output) if output.success() => return Ok(()),
                Ok(_) => {}
                Err(e) => debug!("Link marker check on {} failed: {}", agent.name, e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ExperimentError::Provisioning {
                    role: agent.role,
                    node: agent.node.clone(),
                    reason: format!("link marker {} never appeared", marker.display()),
                });
            }
            tokio::time::sleep(timing.poll_interval).await;
        }
    }

    /// Provision every agent of `experiment` in order. Created agents are
    /// pushed to `agents` as they are launched, including on failure.
    pub async fn provision(
        &self,
        experiment: &Experiment,
        agents: &mut Vec<Agent>,
    ) -> Result<(), ExperimentError> {
        let placement = &experiment.placement;
        let timeout = self.config.spec.timing.readiness_timeout;

        let producer_settings = self.settings_for(experiment, AgentRole::Producer, &placement.producer_node);
        let producer = self
            .launch(AgentRole::Producer, &placement.producer_node, experiment, producer_settings)
            .await?;
        agents.push(producer);
        let status = self.await_ready(agents_last(agents)?, timeout).await?;
        let producer_addr = status.address.ok_or_else(|| ExperimentError::Provisioning {
            role: AgentRole::Producer,
            node: placement.producer_node.clone(),
            reason: "Producer is Ready but has no address".to_string(),
        })?;
        info!("Producer address resolved: {}", producer_addr);

        let mut consumer_settings =
            self.settings_for(experiment, AgentRole::Consumer, &placement.consumer_node);
        consumer_settings.producer_addr = Some(producer_addr);
        let consumer = self
            .launch(AgentRole::Consumer, &placement.consumer_node, experiment, consumer_settings)
            .await?;
        agents.push(consumer);
        self.await_ready(agents_last(agents)?, timeout).await?;

        for agent in agents.iter() {
            self.await_link_marker(agent).await?;
        }

        let mut observers = Vec::with_capacity(placement.observer_nodes.len());
        for node in &placement.observer_nodes {
            let settings = self.settings_for(experiment, AgentRole::Observer, node);
            let observer = self.launch(AgentRole::Observer, node, experiment, settings).await;
            match observer {
                Ok(observer) => observers.push(observer),
                Err(e) => {
                    agents.extend(observers);
                    return Err(e);
                }
            }
        }

        let results = join_all(
            observers
                .iter_mut()
                .map(|observer| self.await_ready(observer, timeout)),
        )
        .await;
        agents.extend(observers);
        for result in results {
            if let Err(e) = result {
                warn!("Observer failed to become Ready: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}

fn agents_last(agents: &mut [Agent]) -> Result<&mut Agent, ExperimentError> {
    agents
        .last_mut()
        .ok_or_else(|| ExperimentError::precondition("provisioning", "no agent launched"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::WorkloadPhase;
    use crate::domain::experiment::NodePlacement;
    use crate::infrastructure::fakes::InMemoryCluster;

    fn experiment(producer: &str, consumer: &str) -> Experiment {
        Experiment::new(
            "exp",
            NodePlacement::new(producer, consumer),
            Duration::from_secs(1),
            "quay.io/netcap/agent:test",
        )
    }

    fn config() -> Arc<ExperimentConfigManifest> {
        let mut config = ExperimentConfigManifest::default();
        config.spec.namespace = "exp".to_string();
        config.spec.timing.poll_interval = Duration::from_millis(10);
        config.spec.timing.readiness_timeout = Duration::from_millis(200);
        Arc::new(config)
    }

    #[test]
    fn test_shell_join_quotes_only_when_needed() {
        let args = vec!["netcap".to_string(), "agent run".to_string(), "it's".to_string()];
        assert_eq!(shell_join(&args), r"netcap 'agent run' 'it'\''s'");
    }

    #[test]
    fn test_observer_spec_uses_host_namespaces_and_keepalive() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = AgentProvisioner::new(
            Arc::new(InMemoryCluster::new(dir.path())),
            config(),
            EventBus::default(),
        );
        let experiment = experiment("worker-1", "worker-2");

        let settings = provisioner.settings_for(&experiment, AgentRole::Observer, "worker-2");
        let spec = provisioner
            .workload_spec(&experiment, AgentRole::Observer, "worker-2", &settings)
            .unwrap();
        assert_eq!(spec.name, "exp-observer-worker-2");
        assert!(spec.host_network && spec.host_pid && spec.privileged);
        assert_eq!(spec.command[..2], ["sh".to_string(), "-c".to_string()]);
        assert_eq!(
            spec.command[2],
            "netcap agent run; sleep infinity & echo $! > \
             /host/tmp/netcap/exp/signals/exp-observer-worker-2/keepalive.pid; wait"
        );
        assert_eq!(
            spec.readiness_check[2],
            "/host/tmp/netcap/exp/signals/exp-observer-worker-2/ready"
        );
        assert_eq!(spec.labels[LABEL_ROLE], "observer");

        let decoded = AgentSettings::from_env_value(&spec.env[AgentSettings::ENV]).unwrap();
        assert_eq!(decoded.role, AgentRole::Observer);
        assert_eq!(decoded.node, "worker-2");

        let settings = provisioner.settings_for(&experiment, AgentRole::Producer, "worker-1");
        let spec = provisioner
            .workload_spec(&experiment, AgentRole::Producer, "worker-1", &settings)
            .unwrap();
        assert!(!spec.host_network);
        assert_eq!(spec.command, vec!["netcap", "agent", "run"]);
    }

    #[tokio::test]
    async fn test_await_ready_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(
            InMemoryCluster::new(dir.path())
                .with_node("worker-1", true)
                .with_namespace("exp"),
        );
        let provisioner = AgentProvisioner::new(cluster, config(), EventBus::default());
        let experiment = experiment("worker-1", "worker-1");
        let settings = provisioner.settings_for(&experiment, AgentRole::Producer, "worker-1");
        let mut agent = provisioner
            .launch(AgentRole::Producer, "worker-1", &experiment, settings)
            .await
            .unwrap();

        let err = provisioner
            .await_ready(&mut agent, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::ReadinessTimeout { .. }));
    }

    #[tokio::test]
    async fn test_crash_before_ready_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(
            InMemoryCluster::new(dir.path())
                .with_node("worker-1", true)
                .with_namespace("exp"),
        );
        let provisioner = AgentProvisioner::new(cluster.clone(), config(), EventBus::default());
        let experiment = experiment("worker-1", "worker-1");
        let settings = provisioner.settings_for(&experiment, AgentRole::Producer, "worker-1");
        let mut agent = provisioner
            .launch(AgentRole::Producer, "worker-1", &experiment, settings)
            .await
            .unwrap();
        cluster.terminate(&agent.workload, WorkloadPhase::Failed);

        let started = tokio::time::Instant::now();
        let err = provisioner
            .await_ready(&mut agent, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Provisioning { role: AgentRole::Producer, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_launch_into_missing_namespace_is_provisioning_error() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new(dir.path()).with_node("worker-1", true));
        let provisioner = AgentProvisioner::new(cluster, config(), EventBus::default());
        let experiment = experiment("worker-1", "worker-1");
        let settings = provisioner.settings_for(&experiment, AgentRole::Consumer, "worker-1");
        let err = provisioner
            .launch(AgentRole::Consumer, "worker-1", &experiment, settings)
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Provisioning { role: AgentRole::Consumer, .. }));
    }
}
