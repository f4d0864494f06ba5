// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Producer: a minimal HTTP responder the Consumer talks to. Every inbound
//! request is recorded in `producer-service.log`.

use super::{pod_capture, write_link_marker};
use crate::application::agent_runtime::{AgentContext, AgentError, BarrierWatch, RoleAction};
use crate::domain::capture::CaptureTarget;
use crate::domain::experiment::AgentRole;
use async_trait::async_trait;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Uri};
use axum::Router;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct ServiceState {
    agent: String,
    log: Mutex<tokio::fs::File>,
    served: AtomicU64,
}

async fn respond(
    State(state): State<Arc<ServiceState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
) -> String {
    let n = state.served.fetch_add(1, Ordering::SeqCst) + 1;
    let line = format!(
        "{} request={} peer={} method={} path={}\n",
        Utc::now().to_rfc3339(),
        n,
        peer,
        method,
        uri.path()
    );
    let mut log = state.log.lock().await;
    if let Err(e) = log.write_all(line.as_bytes()).await {
        warn!("Producer service log write failed: {}", e);
    } else if let Err(e) = log.flush().await {
        warn!("Producer service log flush failed: {}", e);
    }
    drop(log);
    format!("netcap producer {} request {}\n", state.agent, n)
}

pub struct ProducerAction {
    listener: Option<TcpListener>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl ProducerAction {
    pub fn new() -> Self {
        Self {
            listener: None,
            shutdown: CancellationToken::new(),
            server: None,
        }
    }
}

impl Default for ProducerAction {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoleAction for ProducerAction {
    fn role(&self) -> AgentRole {
        AgentRole::Producer
    }

    async fn init(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        write_link_marker(ctx).await?;

        // Bound before Ready so no early connection is refused; served once
        // Start is observed.
        let addr = SocketAddr::from(([0, 0, 0, 0], ctx.settings.service_port));
        let listener = TcpListener::bind(addr).await?;
        ctx.log(format!("service bound on {}", listener.local_addr()?))
            .await?;
        self.listener = Some(listener);
        Ok(())
    }

    async fn interfaces(&mut self, ctx: &AgentContext) -> Result<Vec<CaptureTarget>, AgentError> {
        Ok(pod_capture(ctx))
    }

    async fn on_running(
        &mut self,
        ctx: &AgentContext,
        _barrier: &mut BarrierWatch,
    ) -> Result<(), AgentError> {
        let listener = self.listener.take().ok_or_else(|| AgentError::Role {
            role: AgentRole::Producer,
            reason: "service listener was not bound at init".to_string(),
        })?;

        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(ctx.layout.producer_service_log())
            .await?;
        let state = Arc::new(ServiceState {
            agent: ctx.settings.agent_name.clone(),
            log: Mutex::new(log),
            served: AtomicU64::new(0),
        });

        let app = Router::new().fallback(respond).with_state(state);
        let shutdown = self.shutdown.clone();
        self.server = Some(tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = result {
                warn!("Producer service failed: {}", e);
            }
        }));
        info!("Producer serving on port {}", ctx.settings.service_port);
        ctx.log("service started").await
    }

    async fn drain(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            if tokio::time::timeout(ctx.settings.drain_timeout, server)
                .await
                .is_err()
            {
                warn!("Producer service did not shut down within {:?}", ctx.settings.drain_timeout);
            }
        }
        ctx.log("service stopped").await
    }
}
