// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared-mount file layout.
//!
//! Coordinator and agents never talk directly; they meet on the node's
//! filesystem. Every file has exactly one writer, so the naming here is the
//! whole concurrency story:
//!
//! ```text
//! <root>/signals/<agent>/{start,stop}   coordinator
//! <root>/signals/<agent>/ready          agent
//! <root>/signals/<agent>/keepalive.pid  observer keep-alive wrapper
//! <root>/artifacts/<role>.log           agent
//! <root>/artifacts/<role>.iflink        producer / consumer
//! <root>/artifacts/*.pcap               capture processes
//! ```

use crate::domain::experiment::AgentRole;
use crate::domain::signal::BarrierPhase;
use std::path::{Path, PathBuf};

pub const ARTIFACTS_DIR: &str = "artifacts";
pub const SIGNALS_DIR: &str = "signals";
pub const READY_MARKER: &str = "ready";
pub const KEEPALIVE_PID: &str = "keepalive.pid";
pub const LINK_MARKER_EXT: &str = "iflink";
pub const PRODUCER_SERVICE_LOG: &str = "producer-service.log";
pub const CONSUMER_REQUEST_LOG: &str = "consumer-requests.log";

/// Experiment work directory as seen from one vantage point (inside an
/// agent through the host mount, or a node directory in tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<host_mount>/<host_work_dir>/<experiment>`: the path agents use
    pub fn in_agent(host_mount: &str, host_work_dir: &str, experiment: &str) -> Self {
        Self::new(
            Path::new(host_mount)
                .join(host_work_dir.trim_start_matches('/'))
                .join(experiment),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    pub fn signal_dir(&self, agent: &str) -> PathBuf {
        self.root.join(SIGNALS_DIR).join(agent)
    }

    pub fn signal_marker(&self, agent: &str, phase: BarrierPhase) -> PathBuf {
        self.signal_dir(agent).join(phase.as_str())
    }

    pub fn ready_marker(&self, agent: &str) -> PathBuf {
        self.signal_dir(agent).join(READY_MARKER)
    }

    /// Pid of the keep-alive that holds a finished Observer's container open
    pub fn keepalive_pid(&self, agent: &str) -> PathBuf {
        self.signal_dir(agent).join(KEEPALIVE_PID)
    }

    pub fn role_log(&self, role: AgentRole) -> PathBuf {
        self.artifact_dir().join(format!("{}.log", role))
    }

    pub fn link_marker(&self, role: AgentRole) -> PathBuf {
        self.artifact_dir()
            .join(format!("{}.{}", role, LINK_MARKER_EXT))
    }

    pub fn capture_file(&self, name: &str) -> PathBuf {
        self.artifact_dir().join(format!("{}.pcap", name))
    }

    pub fn producer_service_log(&self) -> PathBuf {
        self.artifact_dir().join(PRODUCER_SERVICE_LOG)
    }

    pub fn consumer_request_log(&self) -> PathBuf {
        self.artifact_dir().join(CONSUMER_REQUEST_LOG)
    }
}

/// Capture file stem for a role's own interface, e.g. `producer-eth0`
pub fn capture_name(role: AgentRole, interface: &str) -> String {
    format!("{}-{}", role, interface)
}

/// Capture file stem for an Observer capture of a peer's host-side veth,
/// e.g. `observer-consumer-veth3a9f`
pub fn correlated_capture_name(peer: AgentRole, veth: &str) -> String {
    format!("{}-{}-{}", AgentRole::Observer, peer, veth)
}

/// Path as a string argument for remote commands
pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
