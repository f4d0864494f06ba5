// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::cluster::{ClusterClient, ClusterError};
use crate::domain::errors::{ExperimentError, NodeSelectionError};
use crate::domain::experiment::{AgentRole, NodePlacement};
use rand::seq::IndexedRandom;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRequest {
    pub producer_node: Option<String>,
    pub consumer_node: Option<String>,
    pub excluded_nodes: Vec<String>,
    /// Never place Producer and Consumer on the same node
    pub require_distinct: bool,
}

/// Resolves the node pair for an experiment. Read-only against the cluster.
pub struct NodeSelector {
    cluster: Arc<dyn ClusterClient>,
}

impl NodeSelector {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    pub async fn select(&self, request: &NodeRequest) -> Result<NodePlacement, ExperimentError> {
        for node in [&request.producer_node, &request.consumer_node].into_iter().flatten() {
            self.validate(node).await?;
        }

        let ready = self.cluster.list_ready_nodes().await?;
        let producer = match &request.producer_node {
            Some(node) => node.clone(),
            None => {
                let avoid = request
                    .require_distinct
                    .then_some(request.consumer_node.as_deref())
                    .flatten();
                pick(&ready, &request.excluded_nodes, avoid, AgentRole::Producer)?
            }
        };
        let consumer = match &request.consumer_node {
            Some(node) => node.clone(),
            None => {
                let avoid = request.require_distinct.then_some(producer.as_str());
                pick(&ready, &request.excluded_nodes, avoid, AgentRole::Consumer)?
            }
        };

        if request.require_distinct && producer == consumer {
            return Err(NodeSelectionError::InsufficientResources {
                role: AgentRole::Consumer,
            }
            .into());
        }

        // Nodes can flip NotReady while we were choosing.
        for node in [&producer, &consumer] {
            self.validate(node).await?;
        }

        let placement = NodePlacement::new(producer, consumer);
        info!(
            "Placement: producer={} consumer={} observers={:?}",
            placement.producer_node, placement.consumer_node, placement.observer_nodes
        );
        Ok(placement)
    }

    async fn validate(&self, node: &str) -> Result<(), ExperimentError> {
        match self.cluster.get_node(node).await {
            Ok(Some(info)) if info.ready => Ok(()),
            Ok(Some(_)) => Err(NodeSelectionError::NodeNotReady(node.to_string()).into()),
            Ok(None) | Err(ClusterError::NotFound(_)) => {
                Err(NodeSelectionError::NodeNotFound(node.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn pick(
    ready: &[String],
    excluded: &[String],
    avoid: Option<&str>,
    role: AgentRole,
) -> Result<String, NodeSelectionError> {
    let candidates: Vec<&String> = ready
        .iter()
        .filter(|n| !excluded.contains(*n))
        .filter(|n| Some(n.as_str()) != avoid)
        .collect();
    debug!("{} candidates for {}: {:?}", candidates.len(), role, candidates);
    candidates
        .choose(&mut rand::rng())
        .map(|n| n.to_string())
        .ok_or(NodeSelectionError::InsufficientResources { role })
}
