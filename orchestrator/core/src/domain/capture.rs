// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Packet-capture process port. The capture program is opaque; the runtime
//! only starts it on an interface and later asks it to stop gracefully.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub interface: String,
    /// Output file (disjoint per capture)
    pub output: PathBuf,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to start capture on {interface}: {reason}")]
    StartFailed { interface: String, reason: String },

    #[error("Failed to stop capture on {interface}: {reason}")]
    StopFailed { interface: String, reason: String },
}

#[async_trait]
pub trait CaptureHandle: Send {
    fn interface(&self) -> &str;

    /// Ask the capture to terminate and flush, waiting at most `grace`
    /// before killing it.
    async fn stop(self: Box<Self>, grace: Duration) -> Result<(), CaptureError>;
}

#[async_trait]
pub trait CaptureLauncher: Send + Sync {
    async fn start(&self, target: &CaptureTarget) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}
