// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Role actions plugged into [`AgentRuntime`](super::agent_runtime::AgentRuntime).

pub mod consumer;
pub mod observer;
pub mod producer;

use crate::application::agent_runtime::{AgentContext, AgentError, RoleAction};
use crate::domain::capture::CaptureTarget;
use crate::domain::experiment::AgentRole;
use crate::domain::layout::capture_name;

pub use consumer::ConsumerAction;
pub use observer::ObserverAction;
pub use producer::ProducerAction;

pub fn action_for(role: AgentRole) -> Box<dyn RoleAction> {
    match role {
        AgentRole::Producer => Box::new(ProducerAction::new()),
        AgentRole::Consumer => Box::new(ConsumerAction::new()),
        AgentRole::Observer => Box::new(ObserverAction::new()),
    }
}

/// Publish the pod interface's link index for the Observer and log it.
async fn write_link_marker(ctx: &AgentContext) -> Result<u32, AgentError> {
    let interface = &ctx.settings.pod_interface;
    let index = ctx.links.pod_link_index(interface).await?;
    tokio::fs::write(ctx.layout.link_marker(ctx.role()), format!("{}\n", index)).await?;
    ctx.log(format!("{} iflink={}", interface, index)).await?;
    Ok(index)
}

/// Single capture on the pod's own interface.
fn pod_capture(ctx: &AgentContext) -> Vec<CaptureTarget> {
    let interface = ctx.settings.pod_interface.clone();
    let output = ctx.layout.capture_file(&capture_name(ctx.role(), &interface));
    vec![CaptureTarget { interface, output }]
}
