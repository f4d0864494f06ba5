// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Signal stores over the node-local marker files.
//!
//! [`FileSignalStore`] is the agent's view: plain filesystem access through
//! the host mount. [`ExecSignalStore`] is the coordinator's view of the same
//! files, reached by exec'ing into the addressed agent's workload.

use crate::domain::cluster::ClusterClient;
use crate::domain::layout::{path_arg, WorkLayout};
use crate::domain::signal::{BarrierPhase, SignalError, SignalState, SignalStore, SignalTarget};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub struct FileSignalStore {
    layout: WorkLayout,
}

impl FileSignalStore {
    pub fn new(layout: WorkLayout) -> Self {
        Self { layout }
    }
}

async fn remove_if_present(path: &Path) -> Result<(), SignalError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl SignalStore for FileSignalStore {
    async fn set(&self, target: &SignalTarget, phase: BarrierPhase) -> Result<(), SignalError> {
        tokio::fs::create_dir_all(self.layout.signal_dir(&target.agent)).await?;
        tokio::fs::write(self.layout.signal_marker(&target.agent, phase), b"").await?;
        Ok(())
    }

    async fn get(&self, target: &SignalTarget) -> Result<SignalState, SignalError> {
        let start = tokio::fs::try_exists(self.layout.signal_marker(&target.agent, BarrierPhase::Start)).await?;
        let stop = tokio::fs::try_exists(self.layout.signal_marker(&target.agent, BarrierPhase::Stop)).await?;
        Ok(SignalState { start, stop })
    }

    async fn clear(&self, target: &SignalTarget) -> Result<(), SignalError> {
        for phase in [BarrierPhase::Start, BarrierPhase::Stop] {
            remove_if_present(&self.layout.signal_marker(&target.agent, phase)).await?;
        }
        Ok(())
    }
}

pub struct ExecSignalStore {
    cluster: Arc<dyn ClusterClient>,
    layout: WorkLayout,
}

impl ExecSignalStore {
    pub fn new(cluster: Arc<dyn ClusterClient>, layout: WorkLayout) -> Self {
        Self { cluster, layout }
    }

    async fn exec_ok(&self, target: &SignalTarget, command: Vec<String>) -> Result<(), SignalError> {
        let output = self
            .cluster
            .exec(&target.workload, &command)
            .await
            .map_err(|e| SignalError::WriteFailed {
                agent: target.agent.clone(),
                reason: e.to_string(),
            })?;
        if !output.success() {
            return Err(SignalError::WriteFailed {
                agent: target.agent.clone(),
                reason: format!(
                    "`{}` exited {}: {}",
                    command.join(" "),
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
        Ok(())
    }

    async fn exists(&self, target: &SignalTarget, path: &Path) -> Result<bool, SignalError> {
        let command = vec!["test".to_string(), "-f".to_string(), path_arg(path)];
        let output = self
            .cluster
            .exec(&target.workload, &command)
            .await
            .map_err(|e| SignalError::ReadFailed {
                agent: target.agent.clone(),
                reason: e.to_string(),
            })?;
        Ok(output.success())
    }
}

#[async_trait]
impl SignalStore for ExecSignalStore {
    async fn set(&self, target: &SignalTarget, phase: BarrierPhase) -> Result<(), SignalError> {
        let dir = path_arg(&self.layout.signal_dir(&target.agent));
        let marker = path_arg(&self.layout.signal_marker(&target.agent, phase));
        self.exec_ok(target, vec!["mkdir".to_string(), "-p".to_string(), dir])
            .await?;
        self.exec_ok(target, vec!["touch".to_string(), marker]).await?;
        debug!("Signal {} written for {}", phase, target.agent);
        Ok(())
    }

    async fn get(&self, target: &SignalTarget) -> Result<SignalState, SignalError> {
        let start = self
            .exists(target, &self.layout.signal_marker(&target.agent, BarrierPhase::Start))
            .await?;
        let stop = self
            .exists(target, &self.layout.signal_marker(&target.agent, BarrierPhase::Stop))
            .await?;
        Ok(SignalState { start, stop })
    }

    async fn clear(&self, target: &SignalTarget) -> Result<(), SignalError> {
        let mut command = vec!["rm".to_string(), "-f".to_string()];
        for phase in [BarrierPhase::Start, BarrierPhase::Stop] {
            command.push(path_arg(&self.layout.signal_marker(&target.agent, phase)));
        }
        self.exec_ok(target, command).await
    }
}
