// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Agent-side commands
//!
//! Commands: run

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::sync::Arc;
use tracing::{info, warn};

use netcap_core::application::agent_runtime::AgentRuntime;
use netcap_core::domain::config::AgentSettings;
use netcap_core::infrastructure::capture::TcpdumpLauncher;
use netcap_core::infrastructure::link_resolver::SysfsLinkResolver;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Run this agent's state machine (inside an agent workload)
    Run {
        /// Agent settings as JSON (set by the orchestrator)
        #[arg(long, env = "NETCAP_AGENT_SETTINGS", hide_env_values = true)]
        settings: String,
    },
}

pub async fn handle_command(command: AgentCommand) -> Result<()> {
    match command {
        AgentCommand::Run { settings } => run(&settings).await,
    }
}

async fn run(raw_settings: &str) -> Result<()> {
    let settings = AgentSettings::from_env_value(raw_settings)
        .with_context(|| format!("Invalid {}", AgentSettings::ENV))?;
    info!(
        "Starting {} agent {} on {} (work dir {:?})",
        settings.role, settings.agent_name, settings.node, settings.work_dir
    );

    let captures = Arc::new(TcpdumpLauncher::new(
        settings.capture_program.clone(),
        settings.capture_args.clone(),
    ));
    let runtime = AgentRuntime::for_settings(settings, Arc::new(SysfsLinkResolver::new()), captures);

    let report = tokio::select! {
        report = runtime.run() => report.context("Agent run failed")?,
        _ = tokio::signal::ctrl_c() => {
            anyhow::bail!("Interrupted before completion");
        }
    };

    for failure in &report.failures {
        warn!("{}", failure);
    }
    println!(
        "{}",
        format!(
            "✓ Agent {} done ({} captures, {} failures)",
            report.agent,
            report.captures.len(),
            report.failures.len()
        )
        .green()
    );
    Ok(())
}
