// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Link-index correlation port.
//!
//! A pod's `eth0` is one end of a veth pair; the pod sees the peer's host
//! ifindex as its own `iflink`. Producer and Consumer publish that number,
//! and the Observer (in the host namespace) maps it back to the host-side
//! interface name so it can capture there.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Interface {0} not found")]
    InterfaceNotFound(String),

    #[error("No default route found")]
    NoDefaultRoute,

    #[error("Malformed link data in {path}: {reason}")]
    Malformed { path: String, reason: String },

    #[error("I/O error reading link state: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait LinkResolver: Send + Sync {
    /// `iflink` of `interface` as seen from the current namespace
    async fn pod_link_index(&self, interface: &str) -> Result<u32, LinkError>;

    /// Host interface whose ifindex equals `index`, if any
    async fn host_interface_for(&self, index: u32) -> Result<Option<String>, LinkError>;

    /// Interface carrying the default route
    async fn default_route_interface(&self) -> Result<String, LinkError>;

    /// All interface names visible in the current namespace
    async fn interfaces(&self) -> Result<Vec<String>, LinkError>;
}

/// Parse the content of a link-index marker file.
pub fn parse_link_marker(content: &str) -> Option<u32> {
    content.trim().parse().ok()
}
