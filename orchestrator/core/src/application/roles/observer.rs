// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Observer: host-level captures on one node.
//!
//! Runs in the host network namespace and captures on the default-route
//! interface, the overlay tunnel interface, and the host side of every
//! co-located Producer/Consumer veth (found through their link markers).

use crate::application::agent_runtime::{AgentContext, AgentError, BarrierWatch, RoleAction};
use crate::domain::capture::CaptureTarget;
use crate::domain::experiment::AgentRole;
use crate::domain::layout::{capture_name, correlated_capture_name, LINK_MARKER_EXT};
use crate::domain::link::parse_link_marker;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{info, warn};

pub struct ObserverAction;

impl ObserverAction {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ObserverAction {
    fn default() -> Self {
        Self::new()
    }
}

/// `(peer role, link index)` for every marker in the artifact directory.
async fn link_markers(ctx: &AgentContext) -> Result<Vec<(AgentRole, u32)>, AgentError> {
    let mut markers = Vec::new();
    let mut entries = tokio::fs::read_dir(ctx.layout.artifact_dir()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LINK_MARKER_EXT) {
            continue;
        }
        let Some(role) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<AgentRole>().ok())
        else {
            warn!("Ignoring unexpected link marker {}", path.display());
            continue;
        };
        let content = tokio::fs::read_to_string(&path).await?;
        match parse_link_marker(&content) {
            Some(index) => markers.push((role, index)),
            None => warn!("Malformed link marker {}", path.display()),
        }
    }
    markers.sort();
    Ok(markers)
}

#[async_trait]
impl RoleAction for ObserverAction {
    fn role(&self) -> AgentRole {
        AgentRole::Observer
    }

    async fn init(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        match ctx.links.default_route_interface().await {
            Ok(iface) => ctx.log(format!("default route via {}", iface)).await,
            Err(e) => ctx.log(format!("default route unavailable: {}", e)).await,
        }
    }

    async fn interfaces(&mut self, ctx: &AgentContext) -> Result<Vec<CaptureTarget>, AgentError> {
        let mut seen = BTreeSet::new();
        let mut targets = Vec::new();
        let mut push = |interface: String, name: String| {
            if seen.insert(interface.clone()) {
                targets.push(CaptureTarget {
                    output: ctx.layout.capture_file(&name),
                    interface,
                });
            }
        };

        match ctx.links.default_route_interface().await {
            Ok(iface) => push(iface.clone(), capture_name(AgentRole::Observer, &iface)),
            Err(e) => warn!("Observer: no default route interface: {}", e),
        }

        // Each target resolves on its own; a failed lookup drops only that one.
        let tunnel = ctx.settings.tunnel_interface.clone();
        match ctx.links.interfaces().await {
            Ok(present) if present.contains(&tunnel) => {
                push(tunnel.clone(), capture_name(AgentRole::Observer, &tunnel))
            }
            Ok(_) => ctx.log(format!("tunnel interface {} not present", tunnel)).await?,
            Err(e) => {
                warn!("Observer: cannot list interfaces: {}", e);
                ctx.log(format!("tunnel interface {} unknown: {}", tunnel, e)).await?;
            }
        }

        let markers = match link_markers(ctx).await {
            Ok(markers) => markers,
            Err(e) => {
                warn!("Observer: cannot read link markers: {}", e);
                Vec::new()
            }
        };
        for (peer, index) in markers {
            match ctx.links.host_interface_for(index).await {
                Ok(Some(veth)) => {
                    ctx.log(format!("{} iflink={} -> {}", peer, index, veth)).await?;
                    push(veth.clone(), correlated_capture_name(peer, &veth));
                }
                Ok(None) => {
                    warn!("Observer: no host interface with ifindex {} ({})", index, peer);
                    ctx.log(format!("{} iflink={} unresolved", peer, index)).await?;
                }
                Err(e) => {
                    warn!("Observer: lookup of ifindex {} ({}) failed: {}", index, peer, e);
                    ctx.log(format!("{} iflink={} unresolved: {}", peer, index, e)).await?;
                }
            }
        }

        info!("Observer capturing on {} interfaces", targets.len());
        Ok(targets)
    }

    async fn on_running(
        &mut self,
        _ctx: &AgentContext,
        _barrier: &mut BarrierWatch,
    ) -> Result<(), AgentError> {
        Ok(())
    }

    async fn drain(&mut self, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::AgentSettings;
    use crate::domain::layout::WorkLayout;
    use crate::infrastructure::fakes::{RecordingCaptureLauncher, StaticLinkResolver};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn context(root: &Path, links: StaticLinkResolver) -> AgentContext {
        let settings = AgentSettings {
            experiment: "exp".to_string(),
            agent_name: "exp-observer-worker-1".to_string(),
            role: AgentRole::Observer,
            node: "worker-1".to_string(),
            work_dir: root.to_path_buf(),
            producer_addr: None,
            service_port: 0,
            signal_poll_interval: Duration::from_millis(10),
            request_interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(1),
            pod_interface: "eth0".to_string(),
            tunnel_interface: "genev_sys_6081".to_string(),
            capture_program: "tcpdump".to_string(),
            capture_args: vec![],
        };
        AgentContext {
            layout: WorkLayout::new(root),
            settings,
            links: Arc::new(links),
            captures: Arc::new(RecordingCaptureLauncher::new()),
        }
    }

    fn write_markers(layout: &WorkLayout) {
        std::fs::create_dir_all(layout.artifact_dir()).unwrap();
        std::fs::write(layout.link_marker(AgentRole::Producer), "17\n").unwrap();
        std::fs::write(layout.link_marker(AgentRole::Consumer), "23\n").unwrap();
    }

    #[tokio::test]
    async fn test_targets_cover_host_tunnel_and_peers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            StaticLinkResolver::new("br-ex")
                .with_interface("genev_sys_6081")
                .with_host_interface(17, "veth-p")
                .with_host_interface(23, "veth-c"),
        );
        write_markers(&ctx.layout);

        let targets = ObserverAction::new().interfaces(&ctx).await.unwrap();
        let interfaces: Vec<&str> = targets.iter().map(|t| t.interface.as_str()).collect();
        assert_eq!(interfaces, vec!["br-ex", "genev_sys_6081", "veth-p", "veth-c"]);
        assert_eq!(
            targets[3].output,
            ctx.layout.capture_file("observer-consumer-veth-c")
        );
    }

    #[tokio::test]
    async fn test_failed_peer_lookup_keeps_other_targets() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            StaticLinkResolver::new("br-ex")
                .with_interface("genev_sys_6081")
                .with_host_interface(23, "veth-c")
                .with_failing_lookup(17),
        );
        write_markers(&ctx.layout);

        let targets = ObserverAction::new().interfaces(&ctx).await.unwrap();
        let interfaces: Vec<&str> = targets.iter().map(|t| t.interface.as_str()).collect();
        assert_eq!(interfaces, vec!["br-ex", "genev_sys_6081", "veth-c"]);

        let log = std::fs::read_to_string(ctx.layout.role_log(AgentRole::Observer)).unwrap();
        assert!(log.contains("producer iflink=17 unresolved"));
        assert!(log.contains("consumer iflink=23 -> veth-c"));
    }
}
