// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Experiment Configuration Types
//
// Defines the configuration schema for a capture experiment:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node placement (explicit or random) and observation window
// - Cluster CLI flavor and privilege grant
// - Shared-mount paths, timing and capture settings
// - AgentSettings: the per-agent slice handed to `netcap agent run`

use crate::domain::experiment::{is_dns_label, AgentRole};
use crate::domain::layout::WorkLayout;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "netcap.io/v1";
pub const KIND: &str = "ExperimentConfig";

/// Top-level Kubernetes-style experiment configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfigManifest {
    /// API version (must be "netcap.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ExperimentConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ExperimentSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Experiment name; also the namespace created for it (must not exist)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Producer node (random Ready node when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_node: Option<String>,

    /// Consumer node (random Ready node when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_node: Option<String>,

    /// Nodes never picked by random selection
    #[serde(default)]
    pub excluded_nodes: Vec<String>,

    /// Force Producer and Consumer onto different nodes when picking randomly
    #[serde(default)]
    pub require_distinct_nodes: bool,

    /// Observation window between Start and Stop
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,

    /// Image carrying the `netcap` binary and the capture program
    #[serde(default = "default_agent_image")]
    pub agent_image: String,

    /// Skip the interactive confirmation
    #[serde(default)]
    pub assume_yes: bool,

    /// Delete agent workloads after collection
    #[serde(default)]
    pub cleanup: bool,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub paths: PathSettings,

    #[serde(default)]
    pub timing: TimingSettings,

    #[serde(default)]
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterFlavor {
    Kubernetes,
    Openshift,
}

impl ClusterFlavor {
    pub fn default_program(&self) -> &'static str {
        match self {
            ClusterFlavor::Kubernetes => "kubectl",
            ClusterFlavor::Openshift => "oc",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_flavor")]
    pub flavor: ClusterFlavor,

    /// Explicit CLI path (default: `kubectl` or `oc` discovered on PATH)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,

    /// Service account the agents run as
    #[serde(default = "default_service_account")]
    pub service_account: String,

    /// Capability granted to the service account (SCC name on OpenShift)
    #[serde(default = "default_capability")]
    pub capability: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            flavor: default_flavor(),
            program: None,
            service_account: default_service_account(),
            capability: default_capability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Where the host filesystem is mounted inside agents
    #[serde(default = "default_host_mount")]
    pub host_mount: String,

    /// Host directory holding per-experiment work dirs
    #[serde(default = "default_host_work_dir")]
    pub host_work_dir: String,

    /// Client-side parent of the result tree
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            host_mount: default_host_mount(),
            host_work_dir: default_host_work_dir(),
            result_dir: default_result_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_readiness_timeout", with = "humantime_serde")]
    pub readiness_timeout: Duration,

    /// Orchestrator-side status polling
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Agent-side barrier polling; bounds the start skew between agents
    #[serde(default = "default_signal_poll_interval", with = "humantime_serde")]
    pub signal_poll_interval: Duration,

    /// Consumer request cadence
    #[serde(default = "default_request_interval", with = "humantime_serde")]
    pub request_interval: Duration,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Soft bound on waiting for an Observer to finish before collecting
    #[serde(default = "default_collection_timeout", with = "humantime_serde")]
    pub collection_timeout: Duration,

    /// Grace period for capture processes to flush on SIGTERM
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            readiness_timeout: default_readiness_timeout(),
            poll_interval: default_poll_interval(),
            signal_poll_interval: default_signal_poll_interval(),
            request_interval: default_request_interval(),
            request_timeout: default_request_timeout(),
            collection_timeout: default_collection_timeout(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "default_capture_program")]
    pub program: String,

    /// Extra arguments passed before `-i <iface> -w <file>`
    #[serde(default = "default_capture_args")]
    pub args: Vec<String>,

    /// Pod-side interface captured by Producer and Consumer
    #[serde(default = "default_pod_interface")]
    pub pod_interface: String,

    /// Overlay tunnel interface captured by every Observer
    #[serde(default = "default_tunnel_interface")]
    pub tunnel_interface: String,

    /// Port the Producer responder listens on
    #[serde(default = "default_service_port")]
    pub service_port: u16,

    /// `netcap` binary inside the agent image
    #[serde(default = "default_agent_binary")]
    pub agent_binary: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            program: default_capture_program(),
            args: default_capture_args(),
            pod_interface: default_pod_interface(),
            tunnel_interface: default_tunnel_interface(),
            service_port: default_service_port(),
            agent_binary: default_agent_binary(),
        }
    }
}

// Default value functions
fn default_namespace() -> String {
    "netcap".to_string()
}

fn default_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_agent_image() -> String {
    "quay.io/netcap/agent:latest".to_string()
}

fn default_flavor() -> ClusterFlavor {
    ClusterFlavor::Kubernetes
}

fn default_service_account() -> String {
    "default".to_string()
}

fn default_capability() -> String {
    "privileged".to_string()
}

fn default_host_mount() -> String {
    "/host".to_string()
}

fn default_host_work_dir() -> String {
    "/tmp/netcap".to_string()
}

fn default_result_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_signal_poll_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_request_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_collection_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_capture_program() -> String {
    "tcpdump".to_string()
}

fn default_capture_args() -> Vec<String> {
    vec!["-n".to_string(), "-U".to_string()]
}

fn default_pod_interface() -> String {
    "eth0".to_string()
}

fn default_tunnel_interface() -> String {
    "genev_sys_6081".to_string()
}

fn default_service_port() -> u16 {
    8080
}

fn default_agent_binary() -> String {
    "netcap".to_string()
}

impl Default for ExperimentSpec {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            producer_node: None,
            consumer_node: None,
            excluded_nodes: vec![],
            require_distinct_nodes: false,
            duration: default_duration(),
            agent_image: default_agent_image(),
            assume_yes: false,
            cleanup: false,
            cluster: ClusterSettings::default(),
            paths: PathSettings::default(),
            timing: TimingSettings::default(),
            capture: CaptureSettings::default(),
        }
    }
}

impl Default for ExperimentConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "netcap".to_string(),
                labels: None,
            },
            spec: ExperimentSpec::default(),
        }
    }
}

impl ExperimentConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. NETCAP_CONFIG_PATH environment variable
    /// 2. ./netcap-config.yaml (working directory)
    /// 3. ~/.netcap/config.yaml (user home)
    /// 4. /etc/netcap/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("NETCAP_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./netcap-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".netcap").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/netcap/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::debug!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("NETCAP_NAMESPACE") {
            tracing::info!("Environment override: NETCAP_NAMESPACE={}", val);
            self.spec.namespace = val;
        }

        if let Ok(val) = std::env::var("NETCAP_AGENT_IMAGE") {
            tracing::info!("Environment override: NETCAP_AGENT_IMAGE={}", val);
            self.spec.agent_image = val;
        }

        if let Ok(val) = std::env::var("NETCAP_DURATION") {
            match humantime::parse_duration(&val) {
                Ok(duration) => {
                    tracing::info!("Environment override: NETCAP_DURATION={}", val);
                    self.spec.duration = duration;
                }
                Err(e) => {
                    tracing::warn!("Invalid value for NETCAP_DURATION: '{}' ({}). Ignoring.", val, e);
                }
            }
        }

        if let Ok(val) = std::env::var("NETCAP_ASSUME_YES") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => self.spec.assume_yes = true,
                "false" | "0" | "no" | "off" => self.spec.assume_yes = false,
                _ => {
                    tracing::warn!(
                        "Invalid value for NETCAP_ASSUME_YES: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration. Runs before any mutating cluster call.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        let spec = &self.spec;
        if !is_dns_label(&spec.namespace) {
            anyhow::bail!(
                "spec.namespace '{}' must be a DNS-1123 label (lowercase alphanumerics and '-', at most 63 chars)",
                spec.namespace
            );
        }

        for (field, node) in [
            ("producer_node", &spec.producer_node),
            ("consumer_node", &spec.consumer_node),
        ] {
            if let Some(node) = node {
                if node.trim().is_empty() {
                    anyhow::bail!("spec.{} cannot be empty when set", field);
                }
            }
        }

        if spec.duration.is_zero() {
            anyhow::bail!("spec.duration must be greater than zero");
        }

        if spec.agent_image.trim().is_empty() {
            anyhow::bail!("spec.agent_image cannot be empty");
        }

        if spec.cluster.service_account.is_empty() {
            anyhow::bail!("spec.cluster.service_account cannot be empty");
        }

        if !spec.paths.host_mount.starts_with('/') || !spec.paths.host_work_dir.starts_with('/') {
            anyhow::bail!("spec.paths.host_mount and spec.paths.host_work_dir must be absolute");
        }

        let timing = &spec.timing;
        for (field, value) in [
            ("readiness_timeout", timing.readiness_timeout),
            ("poll_interval", timing.poll_interval),
            ("signal_poll_interval", timing.signal_poll_interval),
            ("request_interval", timing.request_interval),
            ("request_timeout", timing.request_timeout),
            ("collection_timeout", timing.collection_timeout),
            ("drain_timeout", timing.drain_timeout),
        ] {
            if value.is_zero() {
                anyhow::bail!("spec.timing.{} must be greater than zero", field);
            }
        }

        if spec.capture.program.is_empty() || spec.capture.agent_binary.is_empty() {
            anyhow::bail!("spec.capture.program and spec.capture.agent_binary cannot be empty");
        }

        if spec.capture.service_port == 0 {
            anyhow::bail!("spec.capture.service_port cannot be 0");
        }

        Ok(())
    }

    /// Work layout as seen from inside agents
    pub fn agent_layout(&self) -> WorkLayout {
        WorkLayout::in_agent(
            &self.spec.paths.host_mount,
            &self.spec.paths.host_work_dir,
            &self.spec.namespace,
        )
    }

    /// Settings handed to one agent
    pub fn agent_settings(&self, agent_name: &str, role: AgentRole, node: &str) -> AgentSettings {
        let spec = &self.spec;
        AgentSettings {
            experiment: spec.namespace.clone(),
            agent_name: agent_name.to_string(),
            role,
            node: node.to_string(),
            work_dir: self.agent_layout().root().to_path_buf(),
            producer_addr: None,
            service_port: spec.capture.service_port,
            signal_poll_interval: spec.timing.signal_poll_interval,
            request_interval: spec.timing.request_interval,
            request_timeout: spec.timing.request_timeout,
            drain_timeout: spec.timing.drain_timeout,
            pod_interface: spec.capture.pod_interface.clone(),
            tunnel_interface: spec.capture.tunnel_interface.clone(),
            capture_program: spec.capture.program.clone(),
            capture_args: spec.capture.args.clone(),
        }
    }
}

/// Everything an agent needs to run its state machine. Travels to the
/// workload as JSON in [`AgentSettings::ENV`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    pub experiment: String,
    pub agent_name: String,
    pub role: AgentRole,
    pub node: String,
    pub work_dir: PathBuf,
    /// Producer address, resolved by the orchestrator (Consumer only)
    #[serde(default)]
    pub producer_addr: Option<String>,
    pub service_port: u16,
    #[serde(with = "humantime_serde")]
    pub signal_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    pub pod_interface: String,
    pub tunnel_interface: String,
    pub capture_program: String,
    #[serde(default)]
    pub capture_args: Vec<String>,
}

impl AgentSettings {
    pub const ENV: &'static str = "NETCAP_AGENT_SETTINGS";

    pub fn to_env_value(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(value)?)
    }

    pub fn layout(&self) -> WorkLayout {
        WorkLayout::new(&self.work_dir)
    }
}
