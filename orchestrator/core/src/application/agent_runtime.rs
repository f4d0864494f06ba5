// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-workload agent state machine.
//!
//! Every role runs the same lifecycle:
//!
//! ```text
//! Init -> AwaitStart -> Running -> AwaitStop -> Draining -> Done
//! ```
//!
//! and plugs its behavior in through [`RoleAction`]. Barrier signals are read
//! through a [`SignalStore`] over the shared mount; readiness is published as
//! a marker file the workload's readiness check tests.

use crate::domain::capture::{CaptureHandle, CaptureLauncher, CaptureTarget};
use crate::domain::cluster::WorkloadRef;
use crate::domain::config::AgentSettings;
use crate::domain::experiment::{AgentPhase, AgentRole, PhaseError};
use crate::domain::layout::WorkLayout;
use crate::domain::link::{LinkError, LinkResolver};
use crate::domain::signal::{SignalError, SignalState, SignalStore, SignalTarget};
use crate::infrastructure::signal_store::FileSignalStore;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Signal store error: {0}")]
    Signal(#[from] SignalError),

    #[error("Link resolution error: {0}")]
    Link(#[from] LinkError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error("{role} role failed: {reason}")]
    Role { role: AgentRole, reason: String },

    #[error("I/O error in agent: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a role can touch while running.
pub struct AgentContext {
    pub settings: AgentSettings,
    pub layout: WorkLayout,
    pub links: Arc<dyn LinkResolver>,
    pub captures: Arc<dyn CaptureLauncher>,
}

impl AgentContext {
    pub fn role(&self) -> AgentRole {
        self.settings.role
    }

    /// Append a timestamped line to this role's log.
    pub async fn log(&self, line: impl AsRef<str>) -> Result<(), AgentError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.role_log(self.role()))
            .await?;
        file.write_all(format!("{} {}\n", Utc::now().to_rfc3339(), line.as_ref()).as_bytes())
            .await?;
        Ok(())
    }

    async fn sync_log(&self) -> Result<(), AgentError> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(self.layout.role_log(self.role()))
            .await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Read side of the two-phase barrier for one agent.
pub struct BarrierWatch {
    store: Arc<dyn SignalStore>,
    target: SignalTarget,
    poll_interval: Duration,
    started: bool,
    stopped: bool,
}

impl BarrierWatch {
    pub fn new(store: Arc<dyn SignalStore>, target: SignalTarget, poll_interval: Duration) -> Self {
        Self {
            store,
            target,
            poll_interval,
            started: false,
            stopped: false,
        }
    }

    async fn read(&self) -> Result<SignalState, AgentError> {
        Ok(self.store.get(&self.target).await?)
    }

    /// Block until `start` is observed.
    pub async fn wait_start(&mut self) -> Result<(), AgentError> {
        while !self.started {
            if self.read().await?.observed_start() {
                self.started = true;
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Ok(())
    }

    /// Single non-blocking check for `stop`. Always false before start.
    pub async fn poll_stop(&mut self) -> Result<bool, AgentError> {
        if !self.started {
            return Ok(false);
        }
        if !self.stopped && self.read().await?.observed_stop() {
            self.stopped = true;
        }
        Ok(self.stopped)
    }

    /// Block until `stop` is observed (returns at once if already seen).
    pub async fn wait_stop(&mut self) -> Result<(), AgentError> {
        self.wait_start().await?;
        while !self.poll_stop().await? {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }
}

/// Role-specific behavior plugged into the shared lifecycle.
#[async_trait]
pub trait RoleAction: Send {
    fn role(&self) -> AgentRole;

    /// Role facts and link marker; runs before the agent reports Ready.
    async fn init(&mut self, ctx: &AgentContext) -> Result<(), AgentError>;

    /// Interfaces to capture on once Start is observed.
    async fn interfaces(&mut self, ctx: &AgentContext) -> Result<Vec<CaptureTarget>, AgentError>;

    async fn on_running(
        &mut self,
        ctx: &AgentContext,
        barrier: &mut BarrierWatch,
    ) -> Result<(), AgentError>;

    async fn drain(&mut self, ctx: &AgentContext) -> Result<(), AgentError>;
}

#[derive(Debug, Clone, Default)]
pub struct AgentReport {
    pub agent: String,
    pub role: Option<AgentRole>,
    pub phase: Option<AgentPhase>,
    /// Interfaces a capture was started on
    pub captures: Vec<String>,
    /// Subprocess or role failures that did not abort the lifecycle
    pub failures: Vec<String>,
}

pub struct AgentRuntime {
    ctx: AgentContext,
    action: Box<dyn RoleAction>,
    store: Arc<dyn SignalStore>,
    target: SignalTarget,
    phase: AgentPhase,
}

impl AgentRuntime {
    pub fn new(ctx: AgentContext, action: Box<dyn RoleAction>, store: Arc<dyn SignalStore>) -> Self {
        let settings = &ctx.settings;
        let target = SignalTarget {
            node: settings.node.clone(),
            agent: settings.agent_name.clone(),
            workload: WorkloadRef::new(&settings.experiment, &settings.agent_name),
        };
        Self {
            ctx,
            action,
            store,
            target,
            phase: AgentPhase::Init,
        }
    }

    /// Runtime for `settings.role`, reading signals straight from the
    /// shared mount.
    pub fn for_settings(
        settings: AgentSettings,
        links: Arc<dyn LinkResolver>,
        captures: Arc<dyn CaptureLauncher>,
    ) -> Self {
        let layout = settings.layout();
        let store: Arc<dyn SignalStore> = Arc::new(FileSignalStore::new(layout.clone()));
        let action = super::roles::action_for(settings.role);
        let ctx = AgentContext {
            settings,
            layout,
            links,
            captures,
        };
        Self::new(ctx, action, store)
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    fn enter(&mut self, next: AgentPhase) -> Result<(), AgentError> {
        self.phase.advance(next)?;
        debug!("Agent {} entered {}", self.target.agent, next);
        Ok(())
    }

    pub async fn run(mut self) -> Result<AgentReport, AgentError> {
        let mut report = AgentReport {
            agent: self.target.agent.clone(),
            role: Some(self.action.role()),
            ..Default::default()
        };

        self.init().await?;

        self.enter(AgentPhase::AwaitStart)?;
        let mut barrier = BarrierWatch::new(
            self.store.clone(),
            self.target.clone(),
            self.ctx.settings.signal_poll_interval,
        );
        barrier.wait_start().await?;
        self.ctx.log("start observed").await?;

        self.enter(AgentPhase::Running)?;
        let mut handles = self.start_captures(&mut report).await;
        if let Err(e) = self.action.on_running(&self.ctx, &mut barrier).await {
            warn!("Agent {}: {}", self.target.agent, e);
            report.failures.push(e.to_string());
            self.ctx.log(format!("role action failed: {}", e)).await?;
        }

        self.enter(AgentPhase::AwaitStop)?;
        barrier.wait_stop().await?;
        self.ctx.log("stop observed").await?;

        self.enter(AgentPhase::Draining)?;
        if let Err(e) = self.action.drain(&self.ctx).await {
            warn!("Agent {} drain: {}", self.target.agent, e);
            report.failures.push(e.to_string());
        }
        let grace = self.ctx.settings.drain_timeout;
        for handle in handles.drain(..) {
            let interface = handle.interface().to_string();
            match handle.stop(grace).await {
                Ok(()) => self.ctx.log(format!("capture on {} stopped", interface)).await?,
                Err(e) => {
                    warn!("{}", e);
                    report.failures.push(e.to_string());
                    self.ctx.log(format!("capture on {} stop failed: {}", interface, e)).await?;
                }
            }
        }
        self.ctx.log("done").await?;
        self.ctx.sync_log().await?;

        self.enter(AgentPhase::Done)?;
        let ready = self.ctx.layout.ready_marker(&self.target.agent);
        if let Err(e) = tokio::fs::remove_file(&ready).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        info!("Agent {} done", self.target.agent);

        report.phase = Some(self.phase);
        Ok(report)
    }

    async fn init(&mut self) -> Result<(), AgentError> {
        let agent = self.target.agent.clone();
        self.store.clear(&self.target).await?;
        tokio::fs::create_dir_all(self.ctx.layout.artifact_dir()).await?;
        tokio::fs::create_dir_all(self.ctx.layout.signal_dir(&agent)).await?;

        let settings = &self.ctx.settings;
        self.ctx
            .log(format!(
                "experiment={} agent={} role={} node={}",
                settings.experiment, settings.agent_name, settings.role, settings.node
            ))
            .await?;
        if let Ok(hostname) = std::env::var("HOSTNAME") {
            self.ctx.log(format!("hostname={}", hostname)).await?;
        }
        match self.ctx.links.interfaces().await {
            Ok(interfaces) => self.ctx.log(format!("interfaces={}", interfaces.join(","))).await?,
            Err(e) => self.ctx.log(format!("interfaces unavailable: {}", e)).await?,
        }

        self.action.init(&self.ctx).await?;

        tokio::fs::write(self.ctx.layout.ready_marker(&agent), b"").await?;
        info!("Agent {} ({}) ready", agent, self.ctx.role());
        Ok(())
    }

    async fn start_captures(&mut self, report: &mut AgentReport) -> Vec<Box<dyn CaptureHandle>> {
        let targets = match self.action.interfaces(&self.ctx).await {
            Ok(targets) => targets,
            Err(e) => {
                warn!("Agent {}: cannot resolve capture interfaces: {}", self.target.agent, e);
                report.failures.push(e.to_string());
                Vec::new()
            }
        };

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let line = match self.ctx.captures.start(&target).await {
                Ok(handle) => {
                    report.captures.push(target.interface.clone());
                    handles.push(handle);
                    format!("capture on {} -> {}", target.interface, target.output.display())
                }
                Err(e) => {
                    warn!("{}", e);
                    report.failures.push(e.to_string());
                    format!("capture failed: {}", e)
                }
            };
            if let Err(e) = self.ctx.log(line).await {
                warn!("Agent {}: role log write failed: {}", self.target.agent, e);
            }
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::BarrierPhase;
    use crate::infrastructure::fakes::{RecordingCaptureLauncher, StaticLinkResolver};
    use std::path::Path;

    struct ScriptedRole {
        seen_start_in_running: Arc<parking_lot::Mutex<Option<bool>>>,
    }

    #[async_trait]
    impl RoleAction for ScriptedRole {
        fn role(&self) -> AgentRole {
            AgentRole::Producer
        }

        async fn init(&mut self, ctx: &AgentContext) -> Result<(), AgentError> {
            ctx.log("scripted init").await
        }

        async fn interfaces(&mut self, ctx: &AgentContext) -> Result<Vec<CaptureTarget>, AgentError> {
            Ok(vec![CaptureTarget {
                interface: "eth0".to_string(),
                output: ctx.layout.capture_file("producer-eth0"),
            }])
        }

        async fn on_running(
            &mut self,
            _ctx: &AgentContext,
            barrier: &mut BarrierWatch,
        ) -> Result<(), AgentError> {
            *self.seen_start_in_running.lock() = Some(barrier.started());
            Ok(())
        }

        async fn drain(&mut self, _ctx: &AgentContext) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn settings(root: &Path) -> AgentSettings {
        AgentSettings {
            experiment: "exp".to_string(),
            agent_name: "exp-producer".to_string(),
            role: AgentRole::Producer,
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
        }
    }

    async fn wait_for(path: &Path) {
        for _ in 0..200 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[tokio::test]
    async fn test_lifecycle_follows_the_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path());
        let layout = settings.layout();
        let store: Arc<dyn SignalStore> = Arc::new(FileSignalStore::new(layout.clone()));
        let target = SignalTarget {
            node: "worker-1".to_string(),
            agent: "exp-producer".to_string(),
            workload: WorkloadRef::new("exp", "exp-producer"),
        };

        // Stale markers from an earlier run must not release the barrier.
        store.set(&target, BarrierPhase::Start).await.unwrap();
        store.set(&target, BarrierPhase::Stop).await.unwrap();

        let captures = Arc::new(RecordingCaptureLauncher::new());
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let runtime = AgentRuntime::new(
            AgentContext {
                settings,
                layout: layout.clone(),
                links: Arc::new(StaticLinkResolver::new("eth0")),
                captures: captures.clone(),
            },
            Box::new(ScriptedRole {
                seen_start_in_running: seen.clone(),
            }),
            store.clone(),
        );
        let task = tokio::spawn(runtime.run());

        let ready = layout.ready_marker("exp-producer");
        wait_for(&ready).await;
        assert!(!store.get(&target).await.unwrap().start, "stale start cleared at init");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(captures.started().is_empty(), "no capture before start");

        store.set(&target, BarrierPhase::Start).await.unwrap();
        store.set(&target, BarrierPhase::Stop).await.unwrap();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.phase, Some(AgentPhase::Done));
        assert_eq!(report.captures, vec!["eth0".to_string()]);
        assert_eq!(*seen.lock(), Some(true));
        assert_eq!(captures.stopped(), vec!["eth0".to_string()]);
        assert!(!ready.exists(), "ready marker removed at Done");

        let log = std::fs::read_to_string(layout.role_log(AgentRole::Producer)).unwrap();
        let start = log.find("start observed").unwrap();
        let stop = log.find("stop observed").unwrap();
        assert!(log.contains("scripted init"));
        assert!(start < stop);
    }

    #[tokio::test]
    async fn test_poll_stop_is_false_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkLayout::new(dir.path());
        let store: Arc<dyn SignalStore> = Arc::new(FileSignalStore::new(layout));
        let target = SignalTarget {
            node: "worker-1".to_string(),
            agent: "exp-consumer".to_string(),
            workload: WorkloadRef::new("exp", "exp-consumer"),
        };
        store.set(&target, BarrierPhase::Stop).await.unwrap();

        let mut watch = BarrierWatch::new(store.clone(), target.clone(), Duration::from_millis(5));
        assert!(!watch.poll_stop().await.unwrap());

        store.set(&target, BarrierPhase::Start).await.unwrap();
        watch.wait_start().await.unwrap();
        assert!(watch.poll_stop().await.unwrap());
        watch.wait_stop().await.unwrap();
        assert!(watch.stopped());
    }
}
