// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Cluster control-plane port.
//!
//! Everything the orchestrator needs from the cluster goes through
//! [`ClusterClient`]: node queries, namespace setup, workload lifecycle,
//! status polling and exec. The production adapter drives `kubectl`/`oc`
//! (see `infrastructure::kubectl`); tests use `infrastructure::fakes`
//! (enabled by the `test-support` feature).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub ready: bool,
}

/// Host filesystem bind mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMount {
    pub host_path: String,
    pub mount_path: String,
}

/// Declarative description of one agent workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    /// Node the workload is pinned to
    pub node: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub privileged: bool,
    pub host_network: bool,
    pub host_pid: bool,
    pub host_mount: Option<HostMount>,
    /// Exec readiness check; the workload is Ready while it exits zero
    pub readiness_check: Vec<String>,
    pub service_account: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkloadPhase::Succeeded | WorkloadPhase::Failed)
    }
}

impl From<&str> for WorkloadPhase {
    fn from(value: &str) -> Self {
        match value {
            "Pending" => WorkloadPhase::Pending,
            "Running" => WorkloadPhase::Running,
            "Succeeded" => WorkloadPhase::Succeeded,
            "Failed" => WorkloadPhase::Failed,
            _ => WorkloadPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub ready: bool,
    pub address: Option<String>,
    pub phase: WorkloadPhase,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Plain-text snapshots written into the run summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInventory {
    pub nodes: String,
    pub workloads: String,
    pub events: String,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster CLI '{0}' not found on PATH")]
    CommandNotFound(String),

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("Not authenticated against the cluster: {0}")]
    Unauthorized(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Failed to parse cluster response: {0}")]
    Parse(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Workload {workload} ended ({phase:?}) before becoming Ready")]
    Terminated {
        workload: WorkloadRef,
        phase: WorkloadPhase,
    },

    #[error("I/O error talking to cluster: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Identity of the authenticated user
    async fn whoami(&self) -> Result<String, ClusterError>;

    /// Whether the current user may perform `verb` on `resource`
    async fn can_i(
        &self,
        verb: &str,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<bool, ClusterError>;

    /// Names of schedulable nodes whose Ready condition is true
    async fn list_ready_nodes(&self) -> Result<Vec<String>, ClusterError>;

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>, ClusterError>;

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError>;

    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError>;

    /// Grant `capability` (e.g. a privileged security profile) to the
    /// service account `subject` in `namespace`
    async fn grant_capability(
        &self,
        namespace: &str,
        subject: &str,
        capability: &str,
    ) -> Result<(), ClusterError>;

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadRef, ClusterError>;

    async fn delete_workload(&self, workload: &WorkloadRef) -> Result<(), ClusterError>;

    async fn workload_status(&self, workload: &WorkloadRef) -> Result<WorkloadStatus, ClusterError>;

    async fn exec(&self, workload: &WorkloadRef, command: &[String]) -> Result<ExecOutput, ClusterError>;

    async fn inventory(&self, namespace: &str) -> Result<ClusterInventory, ClusterError>;

    /// Poll [`ClusterClient::workload_status`] until Ready or `timeout`.
    /// A workload that reaches a terminal phase first is reported at once.
    async fn wait_ready(
        &self,
        workload: &WorkloadRef,
        timeout: Duration,
        interval: Duration,
    ) -> Result<WorkloadStatus, ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.workload_status(workload).await?;
            if status.ready {
                return Ok(status);
            }
            if status.phase.is_terminal() {
                return Err(ClusterError::Terminated {
                    workload: workload.clone(),
                    phase: status.phase,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::Timeout(timeout));
            }
            tokio::time::sleep(interval).await;
        }
    }
}
