// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Consumer: issues one request to the Producer every `request_interval`
//! until Stop is observed, logging every attempt.

use super::{pod_capture, write_link_marker};
use crate::application::agent_runtime::{AgentContext, AgentError, BarrierWatch, RoleAction};
use crate::domain::capture::CaptureTarget;
use crate::domain::experiment::AgentRole;
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub struct ConsumerAction {
    attempts: u64,
}

impl ConsumerAction {
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }
}

impl Default for ConsumerAction {
    fn default() -> Self {
        Self::new()
    }
}

fn role_error(reason: impl ToString) -> AgentError {
    AgentError::Role {
        role: AgentRole::Consumer,
        reason: reason.to_string(),
    }
}

#[async_trait]
impl RoleAction for ConsumerAction {
    fn role(&self) -> AgentRole {
        AgentRole::Consumer
    }

    async fn init(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
        write_link_marker(ctx).await?;
        let producer = ctx
            .settings
            .producer_addr
            .as_deref()
            .ok_or_else(|| role_error("no producer address configured"))?;
        ctx.log(format!("target=http://{}:{}/", producer, ctx.settings.service_port))
            .await
    }

    async fn interfaces(&mut self, ctx: &AgentContext) -> Result<Vec<CaptureTarget>, AgentError> {
        Ok(pod_capture(ctx))
    }

    async fn on_running(
        &mut self,
        ctx: &AgentContext,
        barrier: &mut BarrierWatch,
    ) -> Result<(), AgentError> {
        let settings = &ctx.settings;
        let producer = settings
            .producer_addr
            .as_deref()
            .ok_or_else(|| role_error("no producer address configured"))?;
        let url = format!("http://{}:{}/", producer, settings.service_port);
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(role_error)?;

        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(ctx.layout.consumer_request_log())
            .await?;

        // Fixed-rate ticks so slow responses do not stretch the cadence.
        let mut ticker = tokio::time::interval(settings.request_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if barrier.poll_stop().await? {
                break;
            }

            self.attempts += 1;
            let outcome = match client.get(&url).send().await {
                Ok(response) => format!("status={}", response.status().as_u16()),
                Err(e) if e.is_timeout() => "timeout".to_string(),
                Err(e) => format!("error={}", e),
            };
            debug!("Consumer attempt {} -> {}", self.attempts, outcome);
            let line = format!(
                "{} attempt={} outcome={}\n",
                Utc::now().to_rfc3339(),
                self.attempts,
                outcome
            );
            log.write_all(line.as_bytes()).await?;
            log.flush().await?;
        }

        log.flush().await?;
        info!("Consumer issued {} requests", self.attempts);
        ctx.log(format!("requests issued={}", self.attempts)).await
    }

    async fn drain(&mut self, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }
}
