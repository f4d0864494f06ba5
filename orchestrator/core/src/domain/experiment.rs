// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Experiment aggregate: roles, node placement and the agent lifecycle.
//!
//! An [`Experiment`] owns its [`Agent`]s exclusively. Each agent walks the
//! same forward-only [`AgentPhase`] lifecycle regardless of role; the
//! orchestrator keeps its own view of that phase from the outside while the
//! agent runtime drives the authoritative one inside the workload.

use crate::domain::cluster::WorkloadRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Maximum length of a DNS-1123 label (namespace and workload names).
pub const MAX_NAME_LEN: usize = 63;
/// Hex digits of the suffix that keeps truncated names distinct
const NAME_HASH_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Serves the responder the consumer talks to
    Producer,
    /// Issues requests to the producer at a fixed cadence
    Consumer,
    /// Host-level capture, one per distinct node
    Observer,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Producer => "producer",
            AgentRole::Consumer => "consumer",
            AgentRole::Observer => "observer",
        }
    }

    /// Producer and Consumer run in the pod network namespace; only the
    /// Observer joins the host network and PID namespaces.
    pub fn uses_host_network(&self) -> bool {
        matches!(self, AgentRole::Observer)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "producer" => Ok(AgentRole::Producer),
            "consumer" => Ok(AgentRole::Consumer),
            "observer" => Ok(AgentRole::Observer),
            other => Err(format!(
                "Unknown agent role '{}'. Supported: producer, consumer, observer",
                other
            )),
        }
    }
}

/// Agent lifecycle. Variants are declared in lifecycle order so the derived
/// `Ord` doubles as the transition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Init,
    AwaitStart,
    Running,
    AwaitStop,
    Draining,
    Done,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid agent phase transition {from:?} -> {to:?}")]
pub struct PhaseError {
    pub from: AgentPhase,
    pub to: AgentPhase,
}

impl AgentPhase {
    /// Move forward to `next`. Skipping phases is allowed (the orchestrator
    /// only sees some of them); going backwards or standing still is not.
    pub fn advance(&mut self, next: AgentPhase) -> Result<(), PhaseError> {
        if next <= *self {
            return Err(PhaseError { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentPhase::Done)
    }
}

impl fmt::Display for AgentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentPhase::Init => "init",
            AgentPhase::AwaitStart => "await_start",
            AgentPhase::Running => "running",
            AgentPhase::AwaitStop => "await_stop",
            AgentPhase::Draining => "draining",
            AgentPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Validated node assignment for one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePlacement {
    pub producer_node: String,
    pub consumer_node: String,
    /// `unique({producer_node, consumer_node})` in first-seen order
    pub observer_nodes: Vec<String>,
}

impl NodePlacement {
    pub fn new(producer_node: impl Into<String>, consumer_node: impl Into<String>) -> Self {
        let producer_node = producer_node.into();
        let consumer_node = consumer_node.into();
        let mut observer_nodes = vec![producer_node.clone()];
        if consumer_node != producer_node {
            observer_nodes.push(consumer_node.clone());
        }
        Self {
            producer_node,
            consumer_node,
            observer_nodes,
        }
    }

    pub fn shares_node(&self) -> bool {
        self.producer_node == self.consumer_node
    }

    /// Roles (other than Observer) pinned to `node`
    pub fn roles_on(&self, node: &str) -> Vec<AgentRole> {
        let mut roles = Vec::new();
        if self.producer_node == node {
            roles.push(AgentRole::Producer);
        }
        if self.consumer_node == node {
            roles.push(AgentRole::Consumer);
        }
        roles
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub role: AgentRole,
    pub node: String,
    pub workload: WorkloadRef,
    pub phase: AgentPhase,
    pub launched_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(role: AgentRole, node: impl Into<String>, workload: WorkloadRef) -> Self {
        Self {
            name: workload.name.clone(),
            role,
            node: node.into(),
            workload,
            phase: AgentPhase::Init,
            launched_at: Utc::now(),
        }
    }

    /// Orchestrator-side phase tracking. A refused transition is logged and
    /// ignored: the agent itself is the source of truth.
    pub fn observe_phase(&mut self, phase: AgentPhase) {
        if let Err(e) = self.phase.advance(phase) {
            tracing::debug!("Agent {}: {}", self.name, e);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub placement: NodePlacement,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub agent_image: String,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn new(
        name: impl Into<String>,
        placement: NodePlacement,
        duration: Duration,
        agent_image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            placement,
            duration,
            agent_image: agent_image.into(),
            created_at: Utc::now(),
        }
    }

    pub fn workload_name(&self, role: AgentRole, node: &str) -> String {
        match role {
            AgentRole::Observer => workload_name(&[&self.name, role.as_str(), node]),
            _ => workload_name(&[&self.name, role.as_str()]),
        }
    }
}

/// Join `parts` into a DNS-1123 label: lowercase alphanumerics and `-`,
/// no leading/trailing dash, at most [`MAX_NAME_LEN`] characters. Names that
/// have to be cut end in a short hash of the full input.
pub fn workload_name(parts: &[&str]) -> String {
    let joined = parts.join("-").to_ascii_lowercase();
    let mut name = String::with_capacity(joined.len());
    let mut last_dash = true;
    for c in joined.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
            last_dash = false;
        } else if !last_dash {
            name.push('-');
            last_dash = true;
        }
    }
    let name = name.trim_end_matches('-');
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let prefix = name[..MAX_NAME_LEN - NAME_HASH_LEN - 1].trim_end_matches('-');
    format!("{}-{}", prefix, &digest[..NAME_HASH_LEN])
}

/// True when `name` is a valid DNS-1123 label.
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_distinct_nodes() {
        let placement = NodePlacement::new("worker-a", "worker-b");
        assert_eq!(placement.observer_nodes, vec!["worker-a", "worker-b"]);
        assert!(!placement.shares_node());
        assert_eq!(placement.roles_on("worker-b"), vec![AgentRole::Consumer]);
    }

    #[test]
    fn test_placement_shared_node_has_single_observer() {
        let placement = NodePlacement::new("worker-a", "worker-a");
        assert_eq!(placement.observer_nodes, vec!["worker-a"]);
        assert!(placement.shares_node());
        assert_eq!(
            placement.roles_on("worker-a"),
            vec![AgentRole::Producer, AgentRole::Consumer]
        );
    }

    #[test]
    fn test_phase_is_forward_only() {
        let mut phase = AgentPhase::Init;
        assert!(phase.advance(AgentPhase::AwaitStart).is_ok());
        assert!(phase.advance(AgentPhase::Draining).is_ok());
        assert_eq!(
            phase.advance(AgentPhase::Running),
            Err(PhaseError {
                from: AgentPhase::Draining,
                to: AgentPhase::Running
            })
        );
        assert!(phase.advance(AgentPhase::Draining).is_err());
        assert!(phase.advance(AgentPhase::Done).is_ok());
        assert!(phase.is_terminal());
    }

    #[test]
    fn test_workload_name_sanitizing() {
        assert_eq!(
            workload_name(&["Capture", "observer", "ip-10-0-1-7.ec2.internal"]),
            "capture-observer-ip-10-0-1-7-ec2-internal"
        );
        let long = "n".repeat(80);
        let name = workload_name(&["exp", &long]);
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(is_dns_label(&name));
        assert!(!is_dns_label("Bad_Name"));
        assert!(!is_dns_label("-lead"));
    }

    #[test]
    fn test_truncated_names_stay_distinct() {
        let experiment = "netcap-20261019-120000";
        let a = workload_name(&[
            experiment,
            "observer",
            "gke-prod-cluster-default-pool-8f3a2b1c-abcd.us-central1-a",
        ]);
        let b = workload_name(&[
            experiment,
            "observer",
            "gke-prod-cluster-default-pool-8f3a2b1c-wxyz.us-central1-a",
        ]);
        assert_ne!(a, b);
        for name in [&a, &b] {
            assert!(name.len() <= MAX_NAME_LEN);
            assert!(is_dns_label(name));
            assert!(name.starts_with("netcap-20261019-120000-observer-gke-prod-cluster"));
        }
        // Stable across calls
        assert_eq!(
            a,
            workload_name(&[
                experiment,
                "observer",
                "gke-prod-cluster-default-pool-8f3a2b1c-abcd.us-central1-a",
            ])
        );
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Observer".parse::<AgentRole>().unwrap(), AgentRole::Observer);
        assert!("router".parse::<AgentRole>().is_err());
        assert!(AgentRole::Observer.uses_host_network());
        assert!(!AgentRole::Consumer.uses_host_network());
    }
}
