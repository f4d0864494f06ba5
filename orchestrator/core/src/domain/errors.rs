// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Experiment error taxonomy.
//!
//! | Variant | Fatal | Raised by |
//! |---------|-------|-----------|
//! | `Precondition` | yes | orchestrator preflight, config validation |
//! | `NodeSelection` | yes | node selector |
//! | `Provisioning` / `ReadinessTimeout` | yes | provisioner |
//! | `SignalDelivery` | no | barrier coordinator |
//! | `Collection` | no | artifact collector |
//! | `NothingCollected` | yes | orchestrator, after collection |
//!
//! Fatal errors abort the run. Non-fatal errors are accumulated in the run
//! report and printed once at the end.

use crate::domain::cluster::ClusterError;
use crate::domain::experiment::AgentRole;
use crate::domain::signal::BarrierPhase;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
pub enum NodeSelectionError {
    #[error("Node '{0}' does not exist")]
    NodeNotFound(String),

    #[error("Node '{0}' is not Ready")]
    NodeNotReady(String),

    #[error("No Ready node available for the {role} role")]
    InsufficientResources { role: AgentRole },
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Precondition failed ({step}): {reason}")]
    Precondition { step: String, reason: String },

    #[error("Node selection failed: {0}")]
    NodeSelection(#[from] NodeSelectionError),

    #[error("Failed to provision {role} agent on node '{node}': {reason}")]
    Provisioning {
        role: AgentRole,
        node: String,
        reason: String,
    },

    #[error("Agent {agent} did not become Ready within {timeout:?}")]
    ReadinessTimeout { agent: String, timeout: Duration },

    #[error("Failed to deliver {phase} signal to {agent}: {reason}")]
    SignalDelivery {
        agent: String,
        phase: BarrierPhase,
        reason: String,
    },

    #[error("Failed to collect artifacts from node '{node}': {reason}")]
    Collection { node: String, reason: String },

    #[error("No node's artifacts could be collected (result tree: {})", result_dir.display())]
    NothingCollected { result_dir: PathBuf },

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl ExperimentError {
    pub fn precondition(step: impl Into<String>, reason: impl ToString) -> Self {
        ExperimentError::Precondition {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    /// Non-fatal errors are surfaced in the report instead of aborting.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ExperimentError::SignalDelivery { .. } | ExperimentError::Collection { .. }
        )
    }

    /// Short operator-facing remediation hint
    pub fn remediation(&self) -> String {
        match self {
            ExperimentError::Precondition { step, .. } => match step.as_str() {
                "cluster-cli" => "Install kubectl (or oc for OpenShift) and make sure it is on PATH.".to_string(),
                "authentication" => "Log in to the cluster first (kubectl config use-context / oc login).".to_string(),
                "permissions" => "Ask a cluster admin for rights to create namespaces, pods and pods/exec.".to_string(),
                "namespace" => "Pick another experiment name with --namespace, or delete the existing namespace.".to_string(),
                "config" => "Fix the configuration (netcap config validate) and retry.".to_string(),
                _ => "Resolve the failing precondition and retry.".to_string(),
            },
            ExperimentError::NodeSelection(NodeSelectionError::NodeNotFound(_)) => {
                "List nodes with `kubectl get nodes` and pass an existing name.".to_string()
            }
            ExperimentError::NodeSelection(NodeSelectionError::NodeNotReady(_)) => {
                "Choose a Ready node or wait for the node to recover.".to_string()
            }
            ExperimentError::NodeSelection(NodeSelectionError::InsufficientResources { .. }) => {
                "No Ready nodes remain after exclusions; relax --exclude-node or --distinct-nodes.".to_string()
            }
            ExperimentError::Provisioning { .. } => {
                "Inspect the namespace events (kubectl get events -n <namespace>); already created workloads are left in place for cleanup.".to_string()
            }
            ExperimentError::ReadinessTimeout { .. } => {
                "Check image pull and scheduling status of the agent pod, or raise spec.timing.readiness_timeout.".to_string()
            }
            ExperimentError::SignalDelivery { .. } => {
                "The agent never saw the signal; its node will have no artifacts.".to_string()
            }
            ExperimentError::Collection { .. } => {
                "Artifacts may still be on the node under the host work directory.".to_string()
            }
            ExperimentError::NothingCollected { .. } => {
                "Check the observer agents' logs; artifacts may still be on the nodes.".to_string()
            }
            ExperimentError::Cluster(_) => {
                "Check cluster connectivity and retry.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(ExperimentError::precondition("namespace", "exists").is_fatal());
        assert!(ExperimentError::NodeSelection(NodeSelectionError::NodeNotFound("n1".into())).is_fatal());
        assert!(ExperimentError::ReadinessTimeout {
            agent: "a".into(),
            timeout: Duration::from_secs(1)
        }
        .is_fatal());
        assert!(!ExperimentError::SignalDelivery {
            agent: "a".into(),
            phase: BarrierPhase::Start,
            reason: "x".into()
        }
        .is_fatal());
        assert!(!ExperimentError::Collection {
            node: "n1".into(),
            reason: "x".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_remediation_names_the_step() {
        let err = ExperimentError::precondition("namespace", "namespace 'exp' already exists");
        assert!(err.to_string().contains("namespace"));
        assert!(err.remediation().contains("--namespace"));
    }
}
