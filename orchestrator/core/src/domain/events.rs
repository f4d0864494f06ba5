// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::experiment::{AgentRole, NodePlacement};
use crate::domain::signal::BarrierPhase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExperimentEvent {
    PlanResolved {
        experiment: String,
        placement: NodePlacement,
        resolved_at: DateTime<Utc>,
    },
    NamespacePrepared {
        namespace: String,
        prepared_at: DateTime<Utc>,
    },
    AgentLaunched {
        agent: String,
        role: AgentRole,
        node: String,
        launched_at: DateTime<Utc>,
    },
    AgentReady {
        agent: String,
        address: Option<String>,
        ready_at: DateTime<Utc>,
    },
    SignalDelivered {
        agent: String,
        phase: BarrierPhase,
        delivered_at: DateTime<Utc>,
    },
    SignalFailed {
        agent: String,
        phase: BarrierPhase,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    ObservationWindowStarted {
        #[serde(with = "humantime_serde")]
        duration: Duration,
        started_at: DateTime<Utc>,
    },
    ObservationWindowEnded {
        ended_at: DateTime<Utc>,
    },
    AgentFinished {
        agent: String,
        node: String,
        finished_at: DateTime<Utc>,
    },
    ArtifactsCollected {
        node: String,
        files: usize,
        collected_at: DateTime<Utc>,
    },
    CollectionFailed {
        node: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    ExperimentCompleted {
        experiment: String,
        result_dir: PathBuf,
        failures: usize,
        completed_at: DateTime<Utc>,
    },
}

impl ExperimentEvent {
    /// Agent the event refers to, if any
    pub fn agent(&self) -> Option<&str> {
        match self {
            ExperimentEvent::AgentLaunched { agent, .. }
            | ExperimentEvent::AgentReady { agent, .. }
            | ExperimentEvent::SignalDelivered { agent, .. }
            | ExperimentEvent::SignalFailed { agent, .. }
            | ExperimentEvent::AgentFinished { agent, .. } => Some(agent),
            _ => None,
        }
    }
}
