// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use netcap_core::domain::config::ExperimentConfigManifest;

const SAMPLE_CONFIG: &str = include_str!("../../templates/netcap-config.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./netcap-config.yaml)
        #[arg(short, long, default_value = "./netcap-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ExperimentConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. NETCAP_CONFIG_PATH: {}",
            std::env::var("NETCAP_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./netcap-config.yaml");
        println!("  4. ~/.netcap/config.yaml");
        println!("  5. /etc/netcap/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Experiment:".bold());
    println!("  Namespace: {}", spec.namespace);
    println!("  Duration: {}", humantime::format_duration(spec.duration));
    println!("  Agent image: {}", spec.agent_image);
    println!(
        "  Producer node: {}",
        spec.producer_node.as_deref().unwrap_or("(random)")
    );
    println!(
        "  Consumer node: {}",
        spec.consumer_node.as_deref().unwrap_or("(random)")
    );
    if !spec.excluded_nodes.is_empty() {
        println!("  Excluded nodes: {}", spec.excluded_nodes.join(", "));
    }
    println!("  Distinct nodes: {}", spec.require_distinct_nodes);
    println!("  Cleanup: {}", spec.cleanup);
    println!();

    println!("{}", "Cluster:".bold());
    println!("  Flavor: {:?}", spec.cluster.flavor);
    println!(
        "  CLI: {}",
        spec.cluster
            .program
            .as_deref()
            .unwrap_or(spec.cluster.flavor.default_program())
    );
    println!("  Service account: {}", spec.cluster.service_account);
    println!("  Capability: {}", spec.cluster.capability);
    println!();

    println!("{}", "Paths:".bold());
    println!("  Host mount: {}", spec.paths.host_mount);
    println!("  Host work dir: {}", spec.paths.host_work_dir);
    println!("  Result dir: {}", spec.paths.result_dir.display());
    println!();

    let timing = &spec.timing;
    println!("{}", "Timing:".bold());
    for (name, value) in [
        ("Readiness timeout", timing.readiness_timeout),
        ("Poll interval", timing.poll_interval),
        ("Signal poll interval", timing.signal_poll_interval),
        ("Request interval", timing.request_interval),
        ("Request timeout", timing.request_timeout),
        ("Collection timeout", timing.collection_timeout),
        ("Drain timeout", timing.drain_timeout),
    ] {
        println!("  {}: {}", name, humantime::format_duration(value));
    }
    println!();

    println!("{}", "Capture:".bold());
    println!(
        "  Program: {} {}",
        spec.capture.program,
        spec.capture.args.join(" ")
    );
    println!("  Pod interface: {}", spec.capture.pod_interface);
    println!("  Tunnel interface: {}", spec.capture.tunnel_interface);
    println!("  Service port: {}", spec.capture.service_port);
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ExperimentConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
    }

    std::fs::write(&output, SAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_is_valid() {
        let config = ExperimentConfigManifest::from_yaml_str(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.spec.namespace, "netcap-capture");
    }

    #[tokio::test]
    async fn test_generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("netcap-config.yaml");

        generate(output.clone(), false).await.unwrap();
        assert!(generate(output.clone(), false).await.is_err());
        generate(output.clone(), true).await.unwrap();

        validate(Some(output)).await.unwrap();
    }
}
