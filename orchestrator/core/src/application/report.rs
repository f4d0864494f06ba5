// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::application::collector::CollectedArtifacts;
use crate::domain::cluster::ClusterInventory;
use crate::domain::errors::ExperimentError;
use crate::domain::experiment::{Agent, Experiment};
use chrono::{DateTime, Utc};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of a completed run. Fatal errors never reach a report.
#[derive(Debug)]
pub struct RunReport {
    pub experiment: Experiment,
    pub agents: Vec<Agent>,
    pub result_dir: PathBuf,
    pub summary: Option<PathBuf>,
    pub collected: Vec<CollectedArtifacts>,
    /// Non-fatal failures, in the order they happened
    pub failures: Vec<ExperimentError>,
    /// Measured Start-to-Stop issue interval
    pub window: Duration,
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn collected_nodes(&self) -> Vec<&str> {
        self.collected.iter().map(|c| c.node.as_str()).collect()
    }
}

/// Plain-text `summary.txt` for the result tree.
pub fn render_summary(report: &RunReport, inventory: Option<&ClusterInventory>) -> String {
    let experiment = &report.experiment;
    let placement = &experiment.placement;
    let mut out = String::new();

    let _ = writeln!(out, "experiment: {}", experiment.name);
    let _ = writeln!(out, "created:    {}", experiment.created_at.to_rfc3339());
    let _ = writeln!(out, "completed:  {}", report.completed_at.to_rfc3339());
    let _ = writeln!(out, "image:      {}", experiment.agent_image);
    let _ = writeln!(
        out,
        "duration:   {} (measured window {})",
        humantime::format_duration(experiment.duration),
        humantime::format_duration(Duration::from_millis(report.window.as_millis() as u64))
    );

    let _ = writeln!(out, "\n== placement");
    let _ = writeln!(out, "producer: {}", placement.producer_node);
    let _ = writeln!(out, "consumer: {}", placement.consumer_node);
    let _ = writeln!(out, "observers: {}", placement.observer_nodes.join(", "));

    let _ = writeln!(out, "\n== agents");
    for agent in &report.agents {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}",
            agent.name, agent.role, agent.node, agent.phase
        );
    }

    let _ = writeln!(out, "\n== artifacts");
    for collected in &report.collected {
        let _ = writeln!(out, "{}/ ({} files)", collected.node, collected.files.len());
        for file in &collected.files {
            let _ = writeln!(out, "  {}", file.display());
        }
    }

    if let Some(inventory) = inventory {
        for (title, body) in [
            ("nodes", &inventory.nodes),
            ("workloads", &inventory.workloads),
            ("events", &inventory.events),
        ] {
            let _ = writeln!(out, "\n== {}", title);
            let _ = writeln!(out, "{}", body.trim_end());
        }
    }

    let _ = writeln!(out, "\n== failures");
    if report.failures.is_empty() {
        let _ = writeln!(out, "none");
    }
    for failure in &report.failures {
        let _ = writeln!(out, "- {}", failure);
    }
    out
}
