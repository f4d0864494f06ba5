// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process stand-ins for the cluster, link state and capture programs.
//!
//! [`InMemoryCluster`] simulates every node as a directory `<root>/<node>`
//! holding that node's host filesystem. Paths inside workloads are mapped
//! onto it by stripping the host mount prefix, so the exec-based signal
//! store, the collector's `tar` and the agents' shared mount all meet on the
//! same files, exactly as on a real node.

use crate::domain::capture::{CaptureError, CaptureHandle, CaptureLauncher, CaptureTarget};
use crate::domain::cluster::{
    ClusterClient, ClusterError, ClusterInventory, ExecOutput, NodeInfo, WorkloadPhase, WorkloadRef,
    WorkloadSpec, WorkloadStatus,
};
use crate::domain::link::{LinkError, LinkResolver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const FAKE_ADDRESS: &str = "127.0.0.1";
const KEEPALIVE: &str = "sleep infinity";
const KEEPALIVE_PID_REDIRECT: &str = "echo $! > ";
const FIRST_PID: u32 = 4000;

/// Runs a workload's process inside the test. Receives the node's host
/// root and the submitted spec.
#[async_trait]
pub trait WorkloadDriver: Send + Sync {
    async fn run(&self, node_root: PathBuf, spec: WorkloadSpec) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    /// Main command finished; a `sleep infinity` keep-alive with this pid
    /// holds the pod
    KeptAlive(u32),
    Exited(WorkloadPhase),
}

struct FakeWorkload {
    spec: WorkloadSpec,
    state: Arc<Mutex<ProcessState>>,
}

pub struct InMemoryCluster {
    root: PathBuf,
    mount_path: String,
    user: Option<String>,
    denied: BTreeSet<(String, String)>,
    nodes: Mutex<BTreeMap<String, NodeInfo>>,
    namespaces: Mutex<BTreeSet<String>>,
    workloads: Mutex<BTreeMap<WorkloadRef, FakeWorkload>>,
    grants: Mutex<Vec<(String, String, String)>>,
    deleted: Mutex<Vec<WorkloadRef>>,
    exec_log: Mutex<Vec<(WorkloadRef, Vec<String>)>>,
    failing_exec: Mutex<BTreeSet<(String, String)>>,
    failing_workload_exec: Mutex<BTreeSet<(String, String)>>,
    failing_create: Mutex<BTreeSet<String>>,
    next_pid: Arc<AtomicU32>,
    driver: Option<Arc<dyn WorkloadDriver>>,
}

impl InMemoryCluster {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mount_path: "/host".to_string(),
            user: Some("tester".to_string()),
            denied: BTreeSet::new(),
            nodes: Mutex::new(BTreeMap::new()),
            namespaces: Mutex::new(BTreeSet::new()),
            workloads: Mutex::new(BTreeMap::new()),
            grants: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            exec_log: Mutex::new(Vec::new()),
            failing_exec: Mutex::new(BTreeSet::new()),
            failing_workload_exec: Mutex::new(BTreeSet::new()),
            failing_create: Mutex::new(BTreeSet::new()),
            next_pid: Arc::new(AtomicU32::new(FIRST_PID)),
            driver: None,
        }
    }

    pub fn with_node(self, name: &str, ready: bool) -> Self {
        self.nodes.lock().insert(
            name.to_string(),
            NodeInfo {
                name: name.to_string(),
                ready,
            },
        );
        self
    }

    pub fn with_namespace(self, name: &str) -> Self {
        self.namespaces.lock().insert(name.to_string());
        self
    }

    pub fn with_mount_path(mut self, mount_path: &str) -> Self {
        self.mount_path = mount_path.to_string();
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn WorkloadDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn logged_out(mut self) -> Self {
        self.user = None;
        self
    }

    pub fn deny(mut self, verb: &str, resource: &str) -> Self {
        self.denied.insert((verb.to_string(), resource.to_string()));
        self
    }

    /// Make every exec of `program` in workloads on `node` fail.
    pub fn fail_exec(&self, node: &str, program: &str) {
        self.failing_exec
            .lock()
            .insert((node.to_string(), program.to_string()));
    }

    /// Make every exec of `program` in the workload named `workload` fail.
    pub fn fail_exec_in(&self, workload: &str, program: &str) {
        self.failing_workload_exec
            .lock()
            .insert((workload.to_string(), program.to_string()));
    }

    /// Reject the submission of the workload named `workload`.
    pub fn fail_create(&self, workload: &str) {
        self.failing_create.lock().insert(workload.to_string());
    }

    /// Submit a workload whose process has already finished into its
    /// keep-alive, as a finished Observer looks. Returns the keep-alive pid.
    pub async fn create_kept_alive(&self, spec: &WorkloadSpec) -> Result<(WorkloadRef, u32), ClusterError> {
        let workload = self.create_workload(spec).await?;
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        if let Some(pid_file) = keepalive_pid_file(spec) {
            write_pid_file(&self.host_path(&spec.node, pid_file), pid)
                .map_err(ClusterError::Io)?;
        }
        if let Some(w) = self.workloads.lock().get(&workload) {
            *w.state.lock() = ProcessState::KeptAlive(pid);
        }
        Ok((workload, pid))
    }

    /// Whether `workload` is still held open by its keep-alive.
    pub fn is_kept_alive(&self, workload: &WorkloadRef) -> bool {
        self.workloads
            .lock()
            .get(workload)
            .map(|w| matches!(*w.state.lock(), ProcessState::KeptAlive(_)))
            .unwrap_or(false)
    }

    /// Host-side location of `container_path` on `node`.
    pub fn host_path(&self, node: &str, container_path: impl AsRef<Path>) -> PathBuf {
        let path = container_path.as_ref();
        let relative = path.strip_prefix(&self.mount_path).unwrap_or(path);
        let relative = relative.strip_prefix("/").unwrap_or(relative);
        self.root.join(node).join(relative)
    }

    pub fn node_root(&self, node: &str) -> PathBuf {
        self.root.join(node)
    }

    pub fn workloads(&self) -> Vec<WorkloadSpec> {
        self.workloads
            .lock()
            .values()
            .map(|w| w.spec.clone())
            .collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.lock().iter().cloned().collect()
    }

    pub fn grants(&self) -> Vec<(String, String, String)> {
        self.grants.lock().clone()
    }

    pub fn deleted(&self) -> Vec<WorkloadRef> {
        self.deleted.lock().clone()
    }

    pub fn exec_log(&self) -> Vec<(WorkloadRef, Vec<String>)> {
        self.exec_log.lock().clone()
    }

    /// Mark a workload's process as exited, e.g. to simulate a crash.
    pub fn terminate(&self, workload: &WorkloadRef, phase: WorkloadPhase) {
        if let Some(w) = self.workloads.lock().get(workload) {
            *w.state.lock() = ProcessState::Exited(phase);
        }
    }

    fn spec_of(&self, workload: &WorkloadRef) -> Result<(WorkloadSpec, Arc<Mutex<ProcessState>>), ClusterError> {
        self.workloads
            .lock()
            .get(workload)
            .map(|w| (w.spec.clone(), w.state.clone()))
            .ok_or_else(|| ClusterError::NotFound(format!("pod {}", workload)))
    }

    fn run_command(&self, spec: &WorkloadSpec, state: &Mutex<ProcessState>, argv: &[String]) -> ExecOutput {
        let node = spec.node.as_str();
        let fail = |code: i32, stderr: String| ExecOutput {
            stdout: Vec::new(),
            stderr,
            exit_code: code,
        };
        let ok = |stdout: Vec<u8>| ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        };
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();

        match args.as_slice() {
            ["test", "-f", path] => {
                if self.host_path(node, path).is_file() {
                    ok(Vec::new())
                } else {
                    fail(1, String::new())
                }
            }
            ["mkdir", "-p", path] => match std::fs::create_dir_all(self.host_path(node, path)) {
                Ok(()) => ok(Vec::new()),
                Err(e) => fail(1, e.to_string()),
            },
            ["touch", path] => match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.host_path(node, path))
            {
                Ok(_) => ok(Vec::new()),
                Err(e) => fail(1, e.to_string()),
            },
            ["rm", "-f", paths @ ..] => {
                for path in paths {
                    if let Err(e) = std::fs::remove_file(self.host_path(node, path)) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return fail(1, e.to_string());
                        }
                    }
                }
                ok(Vec::new())
            }
            ["tar", "-C", dir, "-cf", "-", "."] => {
                let dir = self.host_path(node, dir);
                if !dir.is_dir() {
                    return fail(2, format!("tar: {}: Cannot open", dir.display()));
                }
                let mut builder = tar::Builder::new(Vec::new());
                if let Err(e) = builder.append_dir_all(".", &dir) {
                    return fail(2, e.to_string());
                }
                match builder.into_inner() {
                    Ok(bytes) => ok(bytes),
                    Err(e) => fail(2, e.to_string()),
                }
            }
            ["cat", path] => match std::fs::read(self.host_path(node, path)) {
                Ok(content) => ok(content),
                Err(e) => fail(1, e.to_string()),
            },
            ["kill", "-TERM", pid] => {
                let Ok(pid) = pid.parse::<u32>() else {
                    return fail(1, format!("kill: {}: arguments must be process ids", pid));
                };
                // A host-PID container sees every process on its node.
                let visible: Vec<Arc<Mutex<ProcessState>>> = if spec.host_pid {
                    self.workloads
                        .lock()
                        .values()
                        .filter(|w| w.spec.node == node)
                        .map(|w| w.state.clone())
                        .collect()
                } else {
                    Vec::new()
                };
                let own = std::iter::once(state);
                for candidate in own.chain(visible.iter().map(|s| s.as_ref())) {
                    let mut candidate = candidate.lock();
                    if *candidate == ProcessState::KeptAlive(pid) {
                        *candidate = ProcessState::Exited(WorkloadPhase::Succeeded);
                        return ok(Vec::new());
                    }
                }
                fail(1, format!("kill: ({}) - No such process", pid))
            }
            _ => fail(127, format!("{}: command not found", argv.join(" "))),
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn whoami(&self) -> Result<String, ClusterError> {
        self.user
            .clone()
            .ok_or_else(|| ClusterError::Unauthorized("no credentials".to_string()))
    }

    async fn can_i(
        &self,
        verb: &str,
        resource: &str,
        _namespace: Option<&str>,
    ) -> Result<bool, ClusterError> {
        Ok(!self
            .denied
            .contains(&(verb.to_string(), resource.to_string())))
    }

    async fn list_ready_nodes(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self
            .nodes
            .lock()
            .values()
            .filter(|n| n.ready)
            .map(|n| n.name.clone())
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>, ClusterError> {
        Ok(self.nodes.lock().get(name).cloned())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool, ClusterError> {
        Ok(self.namespaces.lock().contains(name))
    }

    async fn create_namespace(&self, name: &str) -> Result<(), ClusterError> {
        if !self.namespaces.lock().insert(name.to_string()) {
            return Err(ClusterError::AlreadyExists(format!("namespace {}", name)));
        }
        Ok(())
    }

    async fn grant_capability(
        &self,
        namespace: &str,
        subject: &str,
        capability: &str,
    ) -> Result<(), ClusterError> {
        self.grants.lock().push((
            namespace.to_string(),
            subject.to_string(),
            capability.to_string(),
        ));
        Ok(())
    }

    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<WorkloadRef, ClusterError> {
        if !self.namespaces.lock().contains(&spec.namespace) {
            return Err(ClusterError::NotFound(format!("namespace {}", spec.namespace)));
        }
        if !self.nodes.lock().contains_key(&spec.node) {
            return Err(ClusterError::NotFound(format!("node {}", spec.node)));
        }
        if self.failing_create.lock().contains(&spec.name) {
            return Err(ClusterError::CommandFailed {
                command: format!("create pod {}", spec.name),
                status: 1,
                stderr: "injected create failure".to_string(),
            });
        }

        let workload = WorkloadRef::new(&spec.namespace, &spec.name);
        let state = Arc::new(Mutex::new(ProcessState::Running));
        {
            let mut workloads = self.workloads.lock();
            if workloads.contains_key(&workload) {
                return Err(ClusterError::AlreadyExists(format!("pod {}", workload)));
            }
            workloads.insert(
                workload.clone(),
                FakeWorkload {
                    spec: spec.clone(),
                    state: state.clone(),
                },
            );
        }

        if let Some(driver) = self.driver.clone() {
            let node_root = self.node_root(&spec.node);
            let spec = spec.clone();
            let keepalive = spec.command.iter().any(|arg| arg.contains(KEEPALIVE));
            let pid_file = keepalive_pid_file(&spec).map(|f| self.host_path(&spec.node, f));
            let next_pid = self.next_pid.clone();
            tokio::spawn(async move {
                let name = spec.name.clone();
                let result = driver.run(node_root, spec).await;
                let mut state = state.lock();
                if *state != ProcessState::Running {
                    return;
                }
                *state = match result {
                    Ok(()) if keepalive => {
                        let pid = next_pid.fetch_add(1, Ordering::SeqCst);
                        if let Some(pid_file) = &pid_file {
                            if let Err(e) = write_pid_file(pid_file, pid) {
                                debug!("Fake workload {} could not record its keep-alive: {}", name, e);
                            }
                        }
                        ProcessState::KeptAlive(pid)
                    }
                    Ok(()) => ProcessState::Exited(WorkloadPhase::Succeeded),
                    Err(e) => {
                        debug!("Fake workload {} failed: {}", name, e);
                        ProcessState::Exited(WorkloadPhase::Failed)
                    }
                };
            });
        }
        Ok(workload)
    }

    async fn delete_workload(&self, workload: &WorkloadRef) -> Result<(), ClusterError> {
        self.workloads.lock().remove(workload);
        self.deleted.lock().push(workload.clone());
        Ok(())
    }

    async fn workload_status(&self, workload: &WorkloadRef) -> Result<WorkloadStatus, ClusterError> {
        let (spec, state) = self.spec_of(workload)?;
        let state = *state.lock();
        let phase = match state {
            ProcessState::Running | ProcessState::KeptAlive(_) => WorkloadPhase::Running,
            ProcessState::Exited(phase) => phase,
        };
        let ready = phase == WorkloadPhase::Running
            && match spec.readiness_check.as_slice() {
                [test, flag, path] if test == "test" && flag == "-f" => {
                    self.host_path(&spec.node, path).is_file()
                }
                _ => true,
            };
        Ok(WorkloadStatus {
            ready,
            address: (phase == WorkloadPhase::Running).then(|| FAKE_ADDRESS.to_string()),
            phase,
        })
    }

    async fn exec(&self, workload: &WorkloadRef, command: &[String]) -> Result<ExecOutput, ClusterError> {
        let (spec, state) = self.spec_of(workload)?;
        self.exec_log
            .lock()
            .push((workload.clone(), command.to_vec()));

        if let Some(program) = command.first() {
            if self
                .failing_exec
                .lock()
                .contains(&(spec.node.clone(), program.clone()))
                || self
                    .failing_workload_exec
                    .lock()
                    .contains(&(spec.name.clone(), program.clone()))
            {
                return Err(ClusterError::CommandFailed {
                    command: command.join(" "),
                    status: 1,
                    stderr: "injected exec failure".to_string(),
                });
            }
        }

        if let ProcessState::Exited(_) = *state.lock() {
            return Err(ClusterError::CommandFailed {
                command: command.join(" "),
                status: 1,
                stderr: "container not running".to_string(),
            });
        }
        Ok(self.run_command(&spec, &state, command))
    }

    async fn inventory(&self, namespace: &str) -> Result<ClusterInventory, ClusterError> {
        let nodes = self
            .nodes
            .lock()
            .values()
            .map(|n| format!("{}\t{}\n", n.name, if n.ready { "Ready" } else { "NotReady" }))
            .collect();
        let workloads = self
            .workloads
            .lock()
            .iter()
            .filter(|(w, _)| w.namespace == namespace)
            .map(|(w, f)| format!("{}\t{}\t{:?}\n", w.name, f.spec.node, *f.state.lock()))
            .collect();
        Ok(ClusterInventory {
            nodes,
            workloads,
            events: String::new(),
        })
    }
}

/// Pid file path from a keep-alive wrapper such as
/// `<agent>; sleep infinity & echo $! > <file>; wait`.
fn keepalive_pid_file(spec: &WorkloadSpec) -> Option<&str> {
    spec.command.iter().find_map(|arg| {
        let start = arg.find(KEEPALIVE_PID_REDIRECT)? + KEEPALIVE_PID_REDIRECT.len();
        let rest = &arg[start..];
        let end = rest.find(';').unwrap_or(rest.len());
        Some(rest[..end].trim().trim_matches('\''))
    })
}

fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", pid))
}

/// Link state fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticLinkResolver {
    default_route: Option<String>,
    links: HashMap<String, u32>,
    host_interfaces: HashMap<u32, String>,
    failing_lookups: BTreeSet<u32>,
    interfaces: Vec<String>,
}

impl StaticLinkResolver {
    pub fn new(default_route: &str) -> Self {
        Self {
            default_route: Some(default_route.to_string()),
            interfaces: vec![default_route.to_string()],
            ..Default::default()
        }
    }

    /// `interface` in this namespace has peer ifindex `index`
    pub fn with_link(mut self, interface: &str, index: u32) -> Self {
        self.links.insert(interface.to_string(), index);
        self
    }

    /// Host interface `name` has ifindex `index`
    pub fn with_host_interface(mut self, index: u32, name: &str) -> Self {
        self.host_interfaces.insert(index, name.to_string());
        self.interfaces.push(name.to_string());
        self
    }

    pub fn with_interface(mut self, name: &str) -> Self {
        self.interfaces.push(name.to_string());
        self
    }

    /// Looking up host ifindex `index` fails with an I/O error
    pub fn with_failing_lookup(mut self, index: u32) -> Self {
        self.failing_lookups.insert(index);
        self
    }
}

#[async_trait]
impl LinkResolver for StaticLinkResolver {
    async fn pod_link_index(&self, interface: &str) -> Result<u32, LinkError> {
        self.links
            .get(interface)
            .copied()
            .ok_or_else(|| LinkError::InterfaceNotFound(interface.to_string()))
    }

    async fn host_interface_for(&self, index: u32) -> Result<Option<String>, LinkError> {
        if self.failing_lookups.contains(&index) {
            return Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("ifindex {}", index),
            )));
        }
        Ok(self.host_interfaces.get(&index).cloned())
    }

    async fn default_route_interface(&self) -> Result<String, LinkError> {
        self.default_route.clone().ok_or(LinkError::NoDefaultRoute)
    }

    async fn interfaces(&self) -> Result<Vec<String>, LinkError> {
        Ok(self.interfaces.clone())
    }
}

#[derive(Default)]
struct CaptureRecord {
    started: Vec<CaptureTarget>,
    stopped: Vec<String>,
}

/// Capture launcher that writes a placeholder file per capture and records
/// start/stop calls.
#[derive(Clone, Default)]
pub struct RecordingCaptureLauncher {
    record: Arc<Mutex<CaptureRecord>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
}

impl RecordingCaptureLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, interface: &str) {
        self.failing.lock().insert(interface.to_string());
    }

    /// Interfaces captures were started on, in order
    pub fn started(&self) -> Vec<String> {
        self.record
            .lock()
            .started
            .iter()
            .map(|t| t.interface.clone())
            .collect()
    }

    pub fn targets(&self) -> Vec<CaptureTarget> {
        self.record.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.record.lock().stopped.clone()
    }
}

struct RecordedCapture {
    interface: String,
    record: Arc<Mutex<CaptureRecord>>,
}

#[async_trait]
impl CaptureHandle for RecordedCapture {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn stop(self: Box<Self>, _grace: Duration) -> Result<(), CaptureError> {
        self.record.lock().stopped.push(self.interface.clone());
        Ok(())
    }
}

#[async_trait]
impl CaptureLauncher for RecordingCaptureLauncher {
    async fn start(&self, target: &CaptureTarget) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        if self.failing.lock().contains(&target.interface) {
            return Err(CaptureError::StartFailed {
                interface: target.interface.clone(),
                reason: "injected start failure".to_string(),
            });
        }
        tokio::fs::write(&target.output, format!("capture:{}\n", target.interface))
            .await
            .map_err(|e| CaptureError::StartFailed {
                interface: target.interface.clone(),
                reason: e.to_string(),
            })?;
        self.record.lock().started.push(target.clone());
        Ok(Box::new(RecordedCapture {
            interface: target.interface.clone(),
            record: self.record.clone(),
        }))
    }
}
