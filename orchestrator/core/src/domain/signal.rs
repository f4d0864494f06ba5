// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Two-phase barrier signal port.
//!
//! The coordinator writes `start` then `stop` for each agent; the agent
//! polls for them. No push channel is assumed: a [`SignalStore`] only has to
//! durably remember two booleans per agent. The shared-filesystem and
//! exec-based stores live in `infrastructure::signal_store`.

use crate::domain::cluster::WorkloadRef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierPhase {
    Start,
    Stop,
}

impl BarrierPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BarrierPhase::Start => "start",
            BarrierPhase::Stop => "stop",
        }
    }
}

impl fmt::Display for BarrierPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent addressed by a signal write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalTarget {
    pub node: String,
    pub agent: String,
    pub workload: WorkloadRef,
}

/// Raw marker state as read from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalState {
    pub start: bool,
    pub stop: bool,
}

impl SignalState {
    pub fn observed_start(&self) -> bool {
        self.start
    }

    /// A `stop` marker without `start` is never reported as observed: the
    /// per-agent ordering guarantee is enforced on the reading side too.
    pub fn observed_stop(&self) -> bool {
        self.start && self.stop
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Signal write to {agent} failed: {reason}")]
    WriteFailed { agent: String, reason: String },

    #[error("Signal read for {agent} failed: {reason}")]
    ReadFailed { agent: String, reason: String },

    #[error("I/O error on signal store: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn set(&self, target: &SignalTarget, phase: BarrierPhase) -> Result<(), SignalError>;

    async fn get(&self, target: &SignalTarget) -> Result<SignalState, SignalError>;

    /// Remove stale `start`/`stop` markers left behind by a previous run
    async fn clear(&self, target: &SignalTarget) -> Result<(), SignalError>;
}
