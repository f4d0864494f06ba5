// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `netcap run`: plan, confirm, execute, report.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use netcap_core::application::orchestrator::{ExperimentOrchestrator, ExperimentPlan};
use netcap_core::application::report::RunReport;
use netcap_core::domain::config::ExperimentConfigManifest;
use netcap_core::domain::errors::ExperimentError;
use netcap_core::domain::events::ExperimentEvent;
use netcap_core::infrastructure::event_bus::{EventBus, EventBusError, EventReceiver};
use netcap_core::infrastructure::kubectl::KubectlClient;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Node for the Producer (default: random Ready node)
    #[arg(long, value_name = "NODE")]
    pub producer_node: Option<String>,

    /// Node for the Consumer (default: random Ready node)
    #[arg(long, value_name = "NODE")]
    pub consumer_node: Option<String>,

    /// Experiment name; also the namespace created for it
    #[arg(short, long, value_name = "NAME")]
    pub namespace: Option<String>,

    /// Observation window, e.g. 30s or 2m
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Agent image
    #[arg(long, value_name = "IMAGE")]
    pub image: Option<String>,

    /// Never pick this node at random (repeatable)
    #[arg(long = "exclude-node", value_name = "NODE")]
    pub exclude_nodes: Vec<String>,

    /// Keep Producer and Consumer on different nodes
    #[arg(long)]
    pub distinct_nodes: bool,

    /// Delete agent workloads after collection
    #[arg(long)]
    pub cleanup: bool,

    /// Parent directory of the result tree
    #[arg(long, value_name = "DIR")]
    pub result_dir: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

impl RunArgs {
    /// Flags win over file and environment values.
    pub fn apply(&self, config: &mut ExperimentConfigManifest) {
        let spec = &mut config.spec;
        if let Some(node) = &self.producer_node {
            spec.producer_node = Some(node.clone());
        }
        if let Some(node) = &self.consumer_node {
            spec.consumer_node = Some(node.clone());
        }
        if let Some(namespace) = &self.namespace {
            spec.namespace = namespace.clone();
        }
        if let Some(duration) = self.duration {
            spec.duration = duration;
        }
        if let Some(image) = &self.image {
            spec.agent_image = image.clone();
        }
        for node in &self.exclude_nodes {
            if !spec.excluded_nodes.contains(node) {
                spec.excluded_nodes.push(node.clone());
            }
        }
        spec.require_distinct_nodes |= self.distinct_nodes;
        spec.cleanup |= self.cleanup;
        spec.assume_yes |= self.yes;
        if let Some(dir) = &self.result_dir {
            spec.paths.result_dir = dir.clone();
        }
    }
}

pub async fn execute(args: RunArgs, config_path: Option<PathBuf>) -> Result<()> {
    let mut config =
        ExperimentConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    args.apply(&mut config);

    let cluster = match KubectlClient::discover(&config.spec.cluster) {
        Ok(cluster) => cluster.with_exec_timeout(config.spec.timing.collection_timeout),
        Err(e) => return Err(report_error(ExperimentError::precondition("cluster-cli", e))),
    };

    let assume_yes = config.spec.assume_yes;
    let event_bus = EventBus::default();
    let orchestrator = ExperimentOrchestrator::new(Arc::new(cluster), Arc::new(config), event_bus.clone());

    let plan = orchestrator.plan().await.map_err(report_error)?;
    print_plan(&plan, orchestrator.config());

    if !assume_yes && !confirm()? {
        println!("{}", "Cancelled; nothing was created.".yellow());
        return Ok(());
    }

    let bar = ProgressBar::new_spinner();
    bar.enable_steady_tick(Duration::from_millis(120));
    let progress = tokio::spawn(render_progress(event_bus.subscribe(), bar.clone()));

    let result = orchestrator.execute(plan).await;
    bar.finish_and_clear();
    progress.abort();

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => Err(report_error(e)),
    }
}

fn confirm() -> Result<bool> {
    Confirm::new()
        .with_prompt("Create the namespace and agents?")
        .default(false)
        .interact()
        .context("Confirmation needs an interactive terminal (use --yes)")
}

fn print_plan(plan: &ExperimentPlan, config: &ExperimentConfigManifest) {
    let experiment = &plan.experiment;
    let placement = &experiment.placement;
    println!("{}", "Experiment plan:".bold());
    println!("  User: {}", plan.user);
    println!("  Namespace: {}", experiment.name);
    println!("  Image: {}", experiment.agent_image);
    println!("  Duration: {}", humantime::format_duration(experiment.duration));
    println!("  Producer: {}", placement.producer_node.cyan());
    println!("  Consumer: {}", placement.consumer_node.cyan());
    println!("  Observers: {}", placement.observer_nodes.join(", "));
    println!("  Results: {}", config.spec.paths.result_dir.display());
    if config.spec.cleanup {
        println!("  Workloads are deleted after collection");
    }
    println!();
}

fn print_report(report: &RunReport) {
    println!();
    if report.is_clean() {
        println!("{}", "✓ Experiment complete".green().bold());
    } else {
        println!(
            "{}",
            format!("⚠ Experiment complete with {} failure(s)", report.failures.len())
                .yellow()
                .bold()
        );
    }
    println!("  Results: {}", report.result_dir.display());
    if let Some(summary) = &report.summary {
        println!("  Summary: {}", summary.display());
    }
    println!(
        "  Window: {}",
        humantime::format_duration(Duration::from_millis(report.window.as_millis() as u64))
    );
    for collected in &report.collected {
        println!("  {} {} ({} files)", "✓".green(), collected.node, collected.files.len());
    }
    for failure in &report.failures {
        println!("  {} {}", "✗".red(), failure);
        println!("    {}", failure.remediation().dimmed());
    }
}

/// Print the error with its remediation hint and hand it back for the exit code.
fn report_error(e: ExperimentError) -> anyhow::Error {
    eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
    eprintln!("  {}", e.remediation().dimmed());
    anyhow::Error::new(e)
}

async fn render_progress(mut events: EventReceiver, bar: ProgressBar) {
    let mut window: Option<(Instant, Duration)> = None;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(started) = on_event(&bar, &event) {
                        window = Some(started);
                    }
                    if matches!(event, ExperimentEvent::ObservationWindowEnded { .. }) {
                        window = None;
                        bar.set_style(ProgressStyle::default_spinner());
                    }
                }
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            },
            _ = ticker.tick() => {
                if let Some((started, duration)) = window {
                    let elapsed = started.elapsed().min(duration);
                    bar.set_position(elapsed.as_millis() as u64);
                }
            }
        }
    }
}

/// Update the bar for one event. Returns the window start when the
/// observation window opens.
fn on_event(bar: &ProgressBar, event: &ExperimentEvent) -> Option<(Instant, Duration)> {
    match event {
        ExperimentEvent::PlanResolved { .. } => None,
        ExperimentEvent::NamespacePrepared { namespace, .. } => {
            bar.set_message(format!("namespace {} ready", namespace));
            None
        }
        ExperimentEvent::AgentLaunched { agent, node, .. } => {
            bar.set_message(format!("launched {} on {}", agent, node));
            None
        }
        ExperimentEvent::AgentReady { agent, .. } => {
            bar.println(format!("  {} {} ready", "✓".green(), agent));
            None
        }
        ExperimentEvent::SignalDelivered { .. } => None,
        ExperimentEvent::SignalFailed { agent, phase, reason, .. } => {
            bar.println(format!("  {} {} signal to {}: {}", "✗".red(), phase, agent, reason));
            None
        }
        ExperimentEvent::ObservationWindowStarted { duration, .. } => {
            info!("Observation window open for {}", humantime::format_duration(*duration));
            bar.set_length(duration.as_millis() as u64);
            bar.set_position(0);
            if let Ok(style) =
                ProgressStyle::with_template("{spinner} observing [{bar:40.cyan/blue}] {elapsed_precise} {msg}")
            {
                bar.set_style(style.progress_chars("=> "));
            }
            bar.set_message("");
            Some((Instant::now(), *duration))
        }
        ExperimentEvent::ObservationWindowEnded { .. } => {
            bar.set_message("collecting artifacts");
            None
        }
        ExperimentEvent::AgentFinished { agent, .. } => {
            bar.set_message(format!("{} finished", agent));
            None
        }
        ExperimentEvent::ArtifactsCollected { node, files, .. } => {
            bar.println(format!("  {} collected {} files from {}", "✓".green(), files, node));
            None
        }
        ExperimentEvent::CollectionFailed { node, reason, .. } => {
            bar.println(format!("  {} collection from {} failed: {}", "✗".red(), node, reason));
            None
        }
        ExperimentEvent::ExperimentCompleted { .. } => {
            bar.set_message("done");
            None
        }
    }
}
