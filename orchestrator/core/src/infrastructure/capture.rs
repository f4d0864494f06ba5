// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Capture processes (`tcpdump` by default) run as child processes of the
//! agent. Stopping sends SIGTERM so the program flushes its output file,
//! then falls back to SIGKILL after the grace period.

use crate::domain::capture::{CaptureError, CaptureHandle, CaptureLauncher, CaptureTarget};
use crate::domain::layout::path_arg;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub struct TcpdumpLauncher {
    program: String,
    args: Vec<String>,
}

impl TcpdumpLauncher {
    /// `args` come before the `-i <interface> -w <file>` pair.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl CaptureLauncher for TcpdumpLauncher {
    async fn start(&self, target: &CaptureTarget) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        let start_failed = |reason: String| CaptureError::StartFailed {
            interface: target.interface.clone(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("-i")
            .arg(&target.interface)
            .arg("-w")
            .arg(path_arg(&target.output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| start_failed(format!("{}: {}", self.program, e)))?;

        if let Some(status) = child.try_wait().map_err(|e| start_failed(e.to_string()))? {
            return Err(start_failed(format!("exited immediately with {}", status)));
        }

        info!(
            "Capture started on {} -> {}",
            target.interface,
            target.output.display()
        );
        Ok(Box::new(ProcessCapture {
            interface: target.interface.clone(),
            child,
        }))
    }
}

struct ProcessCapture {
    interface: String,
    child: Child,
}

fn terminate(pid: u32) -> std::io::Result<()> {
    unsafe {
        if libc::kill(pid as i32, libc::SIGTERM) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[async_trait]
impl CaptureHandle for ProcessCapture {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn stop(mut self: Box<Self>, grace: Duration) -> Result<(), CaptureError> {
        let interface = self.interface.clone();
        let stop_failed = |reason: String| CaptureError::StopFailed {
            interface: interface.clone(),
            reason,
        };

        // Already gone (e.g. the interface disappeared mid-run)
        if let Some(status) = self.child.try_wait().map_err(|e| stop_failed(e.to_string()))? {
            debug!("Capture on {} already exited with {}", interface, status);
            return Ok(());
        }

        if let Some(pid) = self.child.id() {
            terminate(pid).map_err(|e| stop_failed(e.to_string()))?;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Capture on {} exited with {}", interface, status);
                Ok(())
            }
            Ok(Err(e)) => Err(stop_failed(e.to_string())),
            Err(_) => {
                warn!(
                    "Capture on {} ignored SIGTERM for {:?}, killing",
                    interface, grace
                );
                self.child
                    .kill()
                    .await
                    .map_err(|e| stop_failed(e.to_string()))
            }
        }
    }
}
