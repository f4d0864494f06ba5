// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Experiment Orchestrator - top-level run sequencing.
//!
//! [`ExperimentOrchestrator::plan`] checks preconditions and resolves node
//! placement without touching the cluster. [`ExperimentOrchestrator::execute`]
//! then creates the namespace, provisions agents, runs the barrier, collects
//! every node and writes the summary.

use crate::application::barrier::BarrierCoordinator;
use crate::application::collector::ArtifactCollector;
use crate::application::node_selector::{NodeRequest, NodeSelector};
use crate::application::provisioner::AgentProvisioner;
use crate::application::report::{render_summary, RunReport};
use crate::domain::cluster::{ClusterClient, ClusterError};
use crate::domain::config::ExperimentConfigManifest;
use crate::domain::errors::ExperimentError;
use crate::domain::events::ExperimentEvent;
use crate::domain::experiment::{Agent, AgentRole, Experiment};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::result_tree::ResultTree;
use crate::infrastructure::signal_store::ExecSignalStore;
use chrono::{Local, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Permissions checked before anything is created: `(verb, resource)`.
const REQUIRED_PERMISSIONS: &[(&str, &str)] = &[
    ("get", "nodes"),
    ("create", "namespaces"),
    ("create", "pods"),
    ("create", "pods/exec"),
];

#[derive(Debug, Clone)]
pub struct ExperimentPlan {
    pub experiment: Experiment,
    /// Authenticated cluster identity
    pub user: String,
}

pub struct ExperimentOrchestrator {
    cluster: Arc<dyn ClusterClient>,
    config: Arc<ExperimentConfigManifest>,
    event_bus: EventBus,
}

impl ExperimentOrchestrator {
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

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &ExperimentConfigManifest {
        &self.config
    }

    /// Preconditions and node selection. No mutating call is made.
    pub async fn plan(&self) -> Result<ExperimentPlan, ExperimentError> {
        self.config
            .validate()
            .map_err(|e| ExperimentError::precondition("config", e))?;
        let spec = &self.config.spec;

        let user = match self.cluster.whoami().await {
            Ok(user) => user,
            Err(ClusterError::CommandNotFound(cli)) => {
                return Err(ExperimentError::precondition(
                    "cluster-cli",
                    format!("'{}' not found", cli),
                ))
            }
            Err(e) => return Err(ExperimentError::precondition("authentication", e)),
        };
        info!("Authenticated as {}", user);

        for (verb, resource) in REQUIRED_PERMISSIONS {
            let allowed = self
                .cluster
                .can_i(verb, resource, None)
                .await
                .map_err(|e| ExperimentError::precondition("permissions", e))?;
            if !allowed {
                return Err(ExperimentError::precondition(
                    "permissions",
                    format!("{} may not {} {}", user, verb, resource),
                ));
            }
        }

        if self.cluster.namespace_exists(&spec.namespace).await? {
            return Err(ExperimentError::precondition(
                "namespace",
                format!("namespace '{}' already exists", spec.namespace),
            ));
        }

        let placement = NodeSelector::new(self.cluster.clone())
            .select(&NodeRequest {
                producer_node: spec.producer_node.clone(),
                consumer_node: spec.consumer_node.clone(),
                excluded_nodes: spec.excluded_nodes.clone(),
                require_distinct: spec.require_distinct_nodes,
            })
            .await?;

        let experiment = Experiment::new(
            spec.namespace.clone(),
            placement,
            spec.duration,
            spec.agent_image.clone(),
        );
        self.event_bus.publish(ExperimentEvent::PlanResolved {
            experiment: experiment.name.clone(),
            placement: experiment.placement.clone(),
            resolved_at: Utc::now(),
        });
        Ok(ExperimentPlan { experiment, user })
    }

    pub async fn execute(&self, plan: ExperimentPlan) -> Result<RunReport, ExperimentError> {
        let experiment = plan.experiment;
        let spec = &self.config.spec;

        let tree = ResultTree::create(&spec.paths.result_dir, &experiment.name, Local::now())
            .map_err(|e| ExperimentError::precondition("result-dir", e))?;
        info!("Results will be written to {}", tree.root().display());

        match self.cluster.create_namespace(&experiment.name).await {
            Ok(()) => {}
            Err(ClusterError::AlreadyExists(_)) => {
                return Err(ExperimentError::precondition(
                    "namespace",
                    format!("namespace '{}' already exists", experiment.name),
                ))
            }
            Err(e) => return Err(e.into()),
        }
        self.cluster
            .grant_capability(
                &experiment.name,
                &spec.cluster.service_account,
                &spec.cluster.capability,
            )
            .await?;
        self.event_bus.publish(ExperimentEvent::NamespacePrepared {
            namespace: experiment.name.clone(),
            prepared_at: Utc::now(),
        });

        let provisioner =
            AgentProvisioner::new(self.cluster.clone(), self.config.clone(), self.event_bus.clone());
        let mut agents: Vec<Agent> = Vec::new();
        if let Err(e) = provisioner.provision(&experiment, &mut agents).await {
            error!("Provisioning failed: {}", e);
            for agent in &agents {
                warn!("Workload left in place: {}", agent.workload);
            }
            return Err(e);
        }

        let store = Arc::new(ExecSignalStore::new(
            self.cluster.clone(),
            self.config.agent_layout(),
        ));
        let barrier = BarrierCoordinator::new(store, self.event_bus.clone());
        let outcome = barrier.run(&mut agents, experiment.duration).await;
        let window = outcome.window();
        let mut failures = outcome.into_failures();

        let collector = ArtifactCollector::new(
            self.cluster.clone(),
            tree.clone(),
            self.config.agent_layout(),
            spec.timing.poll_interval,
            spec.timing.collection_timeout,
            self.event_bus.clone(),
        );
        let results = join_all(
            agents
                .iter_mut()
                .filter(|agent| agent.role == AgentRole::Observer)
                .map(|observer| collector.collect(observer)),
        )
        .await;
        let mut collected = Vec::new();
        for result in results {
            match result {
                Ok(artifacts) => collected.push(artifacts),
                Err(e) => failures.push(e),
            }
        }

        let inventory = match self.cluster.inventory(&experiment.name).await {
            Ok(inventory) => Some(inventory),
            Err(e) => {
                warn!("Cluster inventory unavailable: {}", e);
                None
            }
        };

        if spec.cleanup {
            for agent in &agents {
                if let Err(e) = self.cluster.delete_workload(&agent.workload).await {
                    warn!("Failed to delete {}: {}", agent.workload, e);
                }
            }
        }

        let mut report = RunReport {
            experiment,
            agents,
            result_dir: tree.root().to_path_buf(),
            summary: None,
            collected,
            failures,
            window,
            completed_at: Utc::now(),
        };
        match tree.write_summary(&render_summary(&report, inventory.as_ref())) {
            Ok(path) => report.summary = Some(path),
            Err(e) => warn!("Failed to write summary: {}", e),
        }

        self.event_bus.publish(ExperimentEvent::ExperimentCompleted {
            experiment: report.experiment.name.clone(),
            result_dir: report.result_dir.clone(),
            failures: report.failures.len(),
            completed_at: report.completed_at,
        });

        if report.collected.is_empty() {
            for failure in &report.failures {
                error!("{}", failure);
            }
            return Err(ExperimentError::NothingCollected {
                result_dir: report.result_dir,
            });
        }
        info!(
            "Experiment {} complete: {} node(s) collected, {} failure(s)",
            report.experiment.name,
            report.collected.len(),
            report.failures.len()
        );
        Ok(report)
    }

    pub async fn run(&self) -> Result<RunReport, ExperimentError> {
        let plan = self.plan().await?;
        self.execute(plan).await
    }
}
