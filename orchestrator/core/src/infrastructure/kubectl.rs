// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `kubectl` / `oc` adapter for [`ClusterClient`].
//!
//! Every call shells out to the cluster CLI with `-o json` where a structured
//! answer is needed. Pods are rendered with `serde_json::json!` and created
//! through `create -f -`, so no client-side API model is required.

use crate::domain::cluster::{
    ClusterClient, ClusterError, ClusterInventory, ExecOutput, NodeInfo, WorkloadPhase, WorkloadRef,
    WorkloadSpec, WorkloadStatus,
};
use crate::domain::config::{ClusterFlavor, ClusterSettings};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const CONTAINER_NAME: &str = "agent";
const HOST_VOLUME: &str = "host";
const POD_SECURITY_LABEL: &str = "pod-security.kubernetes.io/enforce";
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

pub struct KubectlClient {
    program: PathBuf,
    flavor: ClusterFlavor,
    command_timeout: Duration,
    /// Bound on `exec`, which also carries artifact archives
    exec_timeout: Duration,
}

impl KubectlClient {
    pub fn new(program: impl Into<PathBuf>, flavor: ClusterFlavor) -> Self {
        Self {
            program: program.into(),
            flavor,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    /// Resolve the CLI binary on PATH (or the explicit `program` override).
    pub fn discover(settings: &ClusterSettings) -> Result<Self, ClusterError> {
        let name = settings
            .program
            .clone()
            .unwrap_or_else(|| settings.flavor.default_program().to_string());
        let program =
            which::which(&name).map_err(|_| ClusterError::CommandNotFound(name.clone()))?;
        debug!("Using cluster CLI at {}", program.display());
        Ok(Self::new(program, settings.flavor))
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn flavor(&self) -> ClusterFlavor {
        self.flavor
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.program.display(), args.join(" "))
    }

    async fn spawn(
        &self,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<std::process::Output, ClusterError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        Ok(child.wait_with_output().await?)
    }

    /// Run a control-plane command and require a zero exit.
    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>, ClusterError> {
        debug!("Running {}", self.describe(args));
        let output = tokio::time::timeout(self.command_timeout, self.spawn(args, stdin))
            .await
            .map_err(|_| ClusterError::Timeout(self.command_timeout))??;

        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(
            self.describe(args),
            output.status.code().unwrap_or(-1),
            stderr,
        ))
    }

    async fn run_json(&self, args: &[String]) -> Result<Value, ClusterError> {
        let stdout = self.run(args, None).await?;
        serde_json::from_slice(&stdout).map_err(|e| ClusterError::Parse(e.to_string()))
    }

    /// Text snapshot for the run summary; failures are recorded inline.
    async fn snapshot(&self, args: &[String]) -> String {
        match self.run(args, None).await {
            Ok(stdout) => String::from_utf8_lossy(&stdout).into_owned(),
            Err(e) => format!("<unavailable: {}>", e),
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Map CLI stderr onto the typed error variants callers branch on.
fn classify_failure(command: String, status: i32, stderr: String) -> ClusterError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("already exists") {
        ClusterError::AlreadyExists(stderr)
    } else if lower.contains("notfound") || lower.contains("not found") {
        ClusterError::NotFound(stderr)
    } else if lower.contains("unauthorized")
        || lower.contains("must be logged in")
        || lower.contains("no configuration has been provided")
    {
        ClusterError::Unauthorized(stderr)
    } else {
        ClusterError::CommandFailed {
            command,
            status,
            stderr,
        }
    }
}

fn condition_true(conditions: Option<&Value>, kind: &str) -> bool {
    conditions
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(kind)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Parse one node object from `get node -o json`.
pub fn parse_node(node: &Value) -> Result<NodeInfo, ClusterError> {
    let name = node
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| ClusterError::Parse("node without metadata.name".to_string()))?;
    let unschedulable = node
        .pointer("/spec/unschedulable")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let ready = !unschedulable && condition_true(node.pointer("/status/conditions"), "Ready");
    Ok(NodeInfo {
        name: name.to_string(),
        ready,
    })
}

/// Parse a pod object from `get pod -o json`.
pub fn parse_pod_status(pod: &Value) -> WorkloadStatus {
    let phase = pod
        .pointer("/status/phase")
        .and_then(Value::as_str)
        .map(WorkloadPhase::from)
        .unwrap_or(WorkloadPhase::Unknown);
    let address = pod
        .pointer("/status/podIP")
        .and_then(Value::as_str)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string);
    WorkloadStatus {
        ready: phase == WorkloadPhase::Running
            && condition_true(pod.pointer("/status/conditions"), "Ready"),
        address,
        phase,
    }
}

/// Render a [`WorkloadSpec`] as a pinned, non-restarting Pod manifest.
pub fn render_pod(spec: &WorkloadSpec) -> Value {
    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let mut container = json!({
        "name": CONTAINER_NAME,
        "image": spec.image,
        "command": spec.command,
        "env": env,
        "securityContext": { "privileged": spec.privileged },
        "readinessProbe": {
            "exec": { "command": spec.readiness_check },
            "periodSeconds": 1,
            "failureThreshold": 1
        }
    });

    let mut pod_spec = json!({
        "nodeName": spec.node,
        "restartPolicy": "Never",
        "hostNetwork": spec.host_network,
        "hostPID": spec.host_pid,
        "terminationGracePeriodSeconds": 30,
        "containers": []
    });

    if spec.host_network {
        pod_spec["dnsPolicy"] = json!("ClusterFirstWithHostNet");
    }
    if let Some(account) = &spec.service_account {
        pod_spec["serviceAccountName"] = json!(account);
    }
    if let Some(mount) = &spec.host_mount {
        container["volumeMounts"] = json!([{ "name": HOST_VOLUME, "mountPath": mount.mount_path }]);
        pod_spec["volumes"] = json!([{
            "name": HOST_VOLUME,
            "hostPath": { "path": mount.host_path, "type": "Directory" }
        }]);
    }
    pod_spec["containers"] = json!([container]);

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels
        },
        "spec": pod_spec
    })
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn whoami(&self) -> Result<String, ClusterError> {
        let argv = match self.flavor {
            ClusterFlavor::Openshift => args(&["whoami"]),
            ClusterFlavor::Kubernetes => args(&[
                "auth",
                "whoami",
                "-o",
                "jsonpath={.status.userInfo.username}",
            ]),
        };
        let stdout = self.run(&argv, None).await?;
        let user = String::from_utf8_lossy(&stdout).trim().to_string();
        if user.is_empty() {
            return Err(ClusterError::Unauthorized("empty identity".to_string()));
        }
        Ok(user)
    }

    async fn can_i(
        &self,
        verb: &str,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<bool, ClusterError> {
        let mut argv = args(&["auth", "can-i", verb, resource]);
        if let Some(ns) = namespace {
            argv.extend(args(&["-n", ns]));
        }
        // `can-i` exits 1 on "no"; only the answer on stdout matters.
        let output = self.spawn(&argv, None).await?;
        let answer = String::from_utf8_lossy(&output.stdout).trim().to_ascii_lowercase();
        match answer.as_str() {
            "yes" => Ok(true),
            "no" => Ok(false),
            _ => Err(classify_failure(
                self.describe(&argv),
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
        }
    }

    async fn list_ready_nodes(&self) -> Result<Vec<String>, ClusterError> {
        let list = self.run_json(&args(&["get", "nodes", "-o", "json"])).await?;
        let items = list
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| ClusterError::Parse("node list without items".to_string()))?;
        let mut ready = Vec::new();
        for item in items {
            let node = parse_node(item)?;
            if node.ready {
                ready.push(node.name);
            }
        }
        Ok(ready)
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>, ClusterError> {
        match self.run_json(&args(&["get", "node", name, "-o", "json"])).await {
            Ok(node) => parse_node(&node).map(Some),
            Err(ClusterError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError> {
        match self
            .run(&args(&["get", "namespace", name, "-o", "name"]), None)
            .await
        {
            Ok(_) => Ok(true),
            Err(ClusterError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let argv = match self.flavor {
            ClusterFlavor::Openshift => args(&["new-project", name]),
            ClusterFlavor::Kubernetes => args(&["create", "namespace", name]),
        };
        self.run(&argv, None).await?;
        info!("Created namespace {}", name);
        Ok(())
    }

    async fn grant_capability(
        &self,
        namespace: &str,
        subject: &str,
        capability: &str,
    ) -> Result<(), ClusterError> {
        let argv = match self.flavor {
            ClusterFlavor::Openshift => args(&[
                "adm",
                "policy",
                "add-scc-to-user",
                capability,
                "-z",
                subject,
                "-n",
                namespace,
            ]),
            // Pod Security Admission is namespace-scoped; the subject is
            // implied by the namespace.
            ClusterFlavor::Kubernetes => {
                let label = format!("{}={}", POD_SECURITY_LABEL, capability);
                args(&["label", "namespace", namespace, &label, "--overwrite"])
            }
        };
        self.run(&argv, None).await?;
        info!(
            "Granted {} to {} in namespace {}",
            capability, subject, namespace
        );
        Ok(())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadRef, ClusterError> {
        let manifest =
            serde_json::to_vec(&render_pod(spec)).map_err(|e| ClusterError::Parse(e.to_string()))?;
        self.run(&args(&["create", "-f", "-"]), Some(&manifest))
            .await?;
        debug!("Created pod {}/{} on node {}", spec.namespace, spec.name, spec.node);
        Ok(WorkloadRef::new(&spec.namespace, &spec.name))
    }

    async fn delete_workload(&self, workload: &WorkloadRef) -> Result<(), ClusterError> {
        self.run(
            &args(&[
                "delete",
                "pod",
                &workload.name,
                "-n",
                &workload.namespace,
                "--ignore-not-found",
                "--wait=false",
            ]),
            None,
        )
        .await?;
        Ok(())
    }

    async fn workload_status(&self, workload: &WorkloadRef) -> Result<WorkloadStatus, ClusterError> {
        let pod = self
            .run_json(&args(&[
                "get",
                "pod",
                &workload.name,
                "-n",
                &workload.namespace,
                "-o",
                "json",
            ]))
            .await?;
        Ok(parse_pod_status(&pod))
    }

    async fn exec(&self, workload: &WorkloadRef, command: &[String]) -> Result<ExecOutput, ClusterError> {
        let mut argv = args(&[
            "exec",
            "-n",
            &workload.namespace,
            &workload.name,
            "-c",
            CONTAINER_NAME,
            "--",
        ]);
        argv.extend(command.iter().cloned());
        debug!("Running {}", self.describe(&argv));

        let output = tokio::time::timeout(self.exec_timeout, self.spawn(&argv, None))
            .await
            .map_err(|_| ClusterError::Timeout(self.exec_timeout))??;
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn inventory(&self, namespace: &str) -> Result<ClusterInventory, ClusterError> {
        Ok(ClusterInventory {
            nodes: self.snapshot(&args(&["get", "nodes", "-o", "wide"])).await,
            workloads: self
                .snapshot(&args(&["get", "pods", "-n", namespace, "-o", "wide"]))
                .await,
            events: self
                .snapshot(&args(&[
                    "get",
                    "events",
                    "-n",
                    namespace,
                    "--sort-by=.lastTimestamp",
                ]))
                .await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cluster::HostMount;
    use std::collections::BTreeMap;

    fn spec(host_network: bool) -> WorkloadSpec {
        WorkloadSpec {
            name: "exp-observer-worker-1".to_string(),
            namespace: "exp".to_string(),
            node: "worker-1".to_string(),
            image: "quay.io/netcap/agent:latest".to_string(),
            command: vec!["netcap".to_string(), "agent".to_string(), "run".to_string()],
            env: BTreeMap::from([("NETCAP_AGENT_SETTINGS".to_string(), "{}".to_string())]),
            labels: BTreeMap::from([("netcap.io/role".to_string(), "observer".to_string())]),
            privileged: true,
            host_network,
            host_pid: host_network,
            host_mount: Some(HostMount {
                host_path: "/".to_string(),
                mount_path: "/host".to_string(),
            }),
            readiness_check: vec!["test".to_string(), "-f".to_string(), "/ready".to_string()],
            service_account: Some("default".to_string()),
        }
    }

    #[test]
    fn test_render_pod_pins_node_and_mounts_host() {
        let pod = render_pod(&spec(true));
        assert_eq!(pod["spec"]["nodeName"], "worker-1");
        assert_eq!(pod["spec"]["restartPolicy"], "Never");
        assert_eq!(pod["spec"]["hostNetwork"], true);
        assert_eq!(pod["spec"]["hostPID"], true);
        assert_eq!(pod["spec"]["dnsPolicy"], "ClusterFirstWithHostNet");
        assert_eq!(pod["spec"]["volumes"][0]["hostPath"]["path"], "/");

        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["securityContext"]["privileged"], true);
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/host");
        assert_eq!(container["readinessProbe"]["exec"]["command"][0], "test");
        assert_eq!(container["env"][0]["name"], "NETCAP_AGENT_SETTINGS");
    }

    #[test]
    fn test_render_pod_without_host_network() {
        let pod = render_pod(&spec(false));
        assert_eq!(pod["spec"]["hostNetwork"], false);
        assert!(pod["spec"].get("dnsPolicy").is_none());
    }

    #[test]
    fn test_parse_node_readiness() {
        let ready = json!({
            "metadata": { "name": "worker-1" },
            "status": { "conditions": [
                { "type": "MemoryPressure", "status": "False" },
                { "type": "Ready", "status": "True" }
            ]}
        });
        assert_eq!(
            parse_node(&ready).unwrap(),
            NodeInfo { name: "worker-1".to_string(), ready: true }
        );

        let cordoned = json!({
            "metadata": { "name": "worker-2" },
            "spec": { "unschedulable": true },
            "status": { "conditions": [{ "type": "Ready", "status": "True" }] }
        });
        assert!(!parse_node(&cordoned).unwrap().ready);

        assert!(parse_node(&json!({})).is_err());
    }

    #[test]
    fn test_parse_pod_status() {
        let pod = json!({
            "status": {
                "phase": "Running",
                "podIP": "10.128.0.12",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        });
        let status = parse_pod_status(&pod);
        assert!(status.ready);
        assert_eq!(status.address.as_deref(), Some("10.128.0.12"));

        let failed = json!({ "status": { "phase": "Failed" } });
        let status = parse_pod_status(&failed);
        assert!(!status.ready);
        assert!(status.phase.is_terminal());
        assert_eq!(status.address, None);
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("x".into(), 1, "Error from server (AlreadyExists): namespaces \"exp\" already exists".into()),
            ClusterError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify_failure("x".into(), 1, "Error from server (NotFound): nodes \"n9\" not found".into()),
            ClusterError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("x".into(), 1, "error: You must be logged in to the server (Unauthorized)".into()),
            ClusterError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_failure("x".into(), 2, "boom".into()),
            ClusterError::CommandFailed { status: 2, .. }
        ));
    }

    /// Stand-in cluster CLI that never answers.
    fn hanging_cli(dir: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("kubectl");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_hung_exec_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let client = KubectlClient::new(hanging_cli(dir.path()), ClusterFlavor::Kubernetes)
            .with_exec_timeout(Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        let err = client
            .exec(
                &WorkloadRef::new("exp", "exp-consumer"),
                &["touch".to_string(), "/host/start".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout(t) if t == Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
