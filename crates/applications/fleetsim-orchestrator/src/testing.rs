//! Test doubles: an in-memory container runtime and a scripted HTTP endpoint

use crate::container::{
    ContainerFilter, ContainerHandle, ContainerRuntime, ContainerStatus, RunSpec,
};
use crate::error::{Result, SimulationError};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::Router;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
struct FakeContainer {
    handle: ContainerHandle,
    labels: HashMap<String, String>,
    status: ContainerStatus,
    removed: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u64,
    containers: Vec<FakeContainer>,
    networks: BTreeSet<String>,
    run_specs: Vec<RunSpec>,
    calls: Vec<String>,
    fail_network: bool,
    fail_run: HashSet<String>,
    fail_remove: HashSet<String>,
    status_on_run: Option<ContainerStatus>,
    status_queues: HashMap<String, VecDeque<ContainerStatus>>,
    exit_codes: HashMap<String, i64>,
    copied_out: Vec<String>,
    stopped: Vec<String>,
    stats: String,
}

impl FakeState {
    fn new_handle(&mut self, name: &str) -> ContainerHandle {
        self.next_id += 1;
        ContainerHandle::new(format!("{:064x}", self.next_id), name)
    }

    fn live(&self, id: &str) -> Option<&FakeContainer> {
        self.containers.iter().find(|c| !c.removed && c.handle.id == id)
    }

    fn live_mut(&mut self, id: &str) -> Option<&mut FakeContainer> {
        self.containers.iter_mut().find(|c| !c.removed && c.handle.id == id)
    }
}

/// In-memory [`ContainerRuntime`]
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Register a container that exists before the test starts
    pub fn add_existing(&self, name: &str, status: ContainerStatus) -> ContainerHandle {
        self.add_labeled(name, status, &[])
    }

    /// Register a pre-existing container carrying labels
    pub fn add_labeled(
        &self,
        name: &str,
        status: ContainerStatus,
        labels: &[(&str, &str)],
    ) -> ContainerHandle {
        self.with_state(|s| {
            let handle = s.new_handle(name);
            s.containers.push(FakeContainer {
                handle: handle.clone(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                status,
                removed: false,
            });
            handle
        })
    }

    /// Make `ensure_network` fail
    pub fn fail_network(&self) {
        self.with_state(|s| s.fail_network = true);
    }

    /// Make `run` fail for the named container
    pub fn fail_run(&self, name: &str) {
        self.with_state(|s| s.fail_run.insert(name.to_string()));
    }

    /// Make `remove` fail for the named container
    pub fn fail_remove(&self, name: &str) {
        self.with_state(|s| s.fail_remove.insert(name.to_string()));
    }

    /// Status newly run containers start in (default running)
    pub fn set_status_on_run(&self, status: ContainerStatus) {
        self.with_state(|s| s.status_on_run = Some(status));
    }

    /// Set the status of every live container with this name
    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        self.with_state(|s| {
            s.status_queues.remove(name);
            for c in s.containers.iter_mut().filter(|c| !c.removed && c.handle.name == name) {
                c.status = status.clone();
            }
        });
    }

    /// Statuses reported one after another; the last one sticks
    pub fn push_statuses(&self, name: &str, statuses: &[ContainerStatus]) {
        self.with_state(|s| {
            s.status_queues
                .entry(name.to_string())
                .or_default()
                .extend(statuses.iter().cloned())
        });
    }

    pub fn set_exit_code(&self, name: &str, code: i64) {
        self.with_state(|s| s.exit_codes.insert(name.to_string(), code));
    }

    pub fn set_stats(&self, stats: &str) {
        self.with_state(|s| s.stats = stats.to_string());
    }

    pub fn run_specs(&self) -> Vec<RunSpec> {
        self.with_state(|s| s.run_specs.clone())
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.with_state(|s| s.networks.contains(name))
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.with_state(|s| s.live(id).is_none())
    }

    pub fn copied_out(&self) -> Vec<String> {
        self.with_state(|s| s.copied_out.clone())
    }

    pub fn stopped(&self) -> Vec<String> {
        self.with_state(|s| s.stopped.clone())
    }

    /// Every runtime call as `"<op> <name>"`, in order
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("network {}", name));
            if s.fail_network {
                return Err(SimulationError::provisioning(format!("network {} refused", name)));
            }
            s.networks.insert(name.to_string());
            Ok(())
        })
    }

    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle> {
        self.with_state(|s| {
            s.calls.push(format!("run {}", spec.name));
            if s.fail_run.contains(&spec.name) {
                return Err(SimulationError::provisioning(format!("{} refused", spec.name)));
            }
            if s.containers.iter().any(|c| !c.removed && c.handle.name == spec.name) {
                return Err(SimulationError::provisioning(format!(
                    "name {} already in use",
                    spec.name
                )));
            }

            let handle = s.new_handle(&spec.name);
            let status = s.status_on_run.clone().unwrap_or(ContainerStatus::Running);
            s.containers.push(FakeContainer {
                handle: handle.clone(),
                labels: spec.labels.clone().into_iter().collect(),
                status,
                removed: false,
            });
            s.run_specs.push(spec.clone());
            Ok(handle)
        })
    }

    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerHandle>> {
        self.with_state(|s| {
            Ok(s.containers
                .iter()
                .filter(|c| !c.removed)
                .filter(|c| match filter {
                    ContainerFilter::Name(name) => &c.handle.name == name,
                    ContainerFilter::Label(k, v) => c.labels.get(k) == Some(v),
                })
                .map(|c| c.handle.clone())
                .collect())
        })
    }

    async fn get(&self, id_or_name: &str) -> Result<ContainerHandle> {
        self.with_state(|s| {
            s.containers
                .iter()
                .filter(|c| !c.removed)
                .find(|c| {
                    c.handle.name == id_or_name
                        || (id_or_name.len() >= 12 && c.handle.id.starts_with(id_or_name))
                })
                .map(|c| c.handle.clone())
                .ok_or_else(|| SimulationError::NotFound(id_or_name.to_string()))
        })
    }

    async fn status(&self, container: &ContainerHandle) -> Result<ContainerStatus> {
        self.with_state(|s| {
            if s.live(&container.id).is_none() {
                return Err(SimulationError::NotFound(container.name.clone()));
            }
            if let Some(queue) = s.status_queues.get_mut(&container.name) {
                if queue.len() > 1 {
                    if let Some(next) = queue.pop_front() {
                        return Ok(next);
                    }
                } else if let Some(last) = queue.front() {
                    return Ok(last.clone());
                }
            }
            s.live(&container.id)
                .map(|c| c.status.clone())
                .ok_or_else(|| SimulationError::NotFound(container.name.clone()))
        })
    }

    async fn wait(&self, container: &ContainerHandle) -> Result<i64> {
        self.with_state(|s| {
            s.calls.push(format!("wait {}", container.name));
            let code = s.exit_codes.get(&container.name).copied().unwrap_or(0);
            let c = s
                .live_mut(&container.id)
                .ok_or_else(|| SimulationError::NotFound(container.name.clone()))?;
            c.status = ContainerStatus::Exited;
            Ok(code)
        })
    }

    async fn stop(&self, container: &ContainerHandle, _timeout: Duration) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("stop {}", container.name));
            let c = s
                .live_mut(&container.id)
                .ok_or_else(|| SimulationError::NotFound(container.name.clone()))?;
            c.status = ContainerStatus::Exited;
            s.stopped.push(container.name.clone());
            Ok(())
        })
    }

    async fn remove(&self, container: &ContainerHandle, _force: bool) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("remove {}", container.name));
            if s.fail_remove.contains(&container.name) {
                return Err(SimulationError::docker(format!("{} is stuck", container.name)));
            }
            let c = s
                .live_mut(&container.id)
                .ok_or_else(|| SimulationError::NotFound(container.name.clone()))?;
            c.removed = true;
            Ok(())
        })
    }

    async fn logs(&self, container: &ContainerHandle) -> Result<Vec<u8>> {
        self.with_state(|s| {
            s.live(&container.id)
                .map(|c| format!("logs of {}", c.handle.name).into_bytes())
                .ok_or_else(|| SimulationError::NotFound(container.name.clone()))
        })
    }

    async fn copy_out(&self, container: &ContainerHandle, _src: &str, dest: &Path) -> Result<()> {
        self.with_state(|s| {
            s.calls.push(format!("copy {}", container.name));
            s.copied_out.push(container.name.clone());
        });
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("results.txt"), "done")?;
        Ok(())
    }

    async fn stats(&self) -> Result<String> {
        Ok(self.with_state(|s| s.stats.clone()))
    }
}

/// A request seen by a [`StubServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubRequest {
    pub port: u16,
    pub method: String,
    pub path: String,
    pub body: String,
    /// Status the stub answered with, 0 if it never answered
    pub status: u16,
}

/// Decides the status code of each request
pub type Responder = Arc<dyn Fn(&StubRequest) -> u16 + Send + Sync>;

/// Ordered log shared by a group of stub servers
#[derive(Debug, Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<StubRequest>>>);

impl RequestLog {
    pub fn snapshot(&self) -> Vec<StubRequest> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    /// `"<METHOD> <path>"` of every request, in arrival order
    pub fn lines(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }

    fn push(&self, request: StubRequest) {
        self.0.lock().unwrap().push(request);
    }
}

/// HTTP endpoint answering every route with a scripted status code
pub struct StubServer {
    pub port: u16,
    task: JoinHandle<()>,
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A local port nothing listens on
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

impl StubServer {
    /// One stub on an ephemeral port
    pub async fn start<F>(responder: F) -> (StubServer, RequestLog)
    where
        F: Fn(&StubRequest) -> u16 + Send + Sync + 'static,
    {
        let (mut servers, log) = Self::start_consecutive(1, responder).await;
        (servers.remove(0), log)
    }

    /// `n` stubs on consecutive ports sharing one responder and one log
    pub async fn start_consecutive<F>(n: u16, responder: F) -> (Vec<StubServer>, RequestLog)
    where
        F: Fn(&StubRequest) -> u16 + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(responder);
        let log = RequestLog::default();

        for _ in 0..50 {
            let base = free_port();
            if base.checked_add(n).is_none() {
                continue;
            }

            let mut listeners = Vec::new();
            for i in 0..n {
                match TcpListener::bind(("127.0.0.1", base + i)).await {
                    Ok(listener) => listeners.push(listener),
                    Err(_) => break,
                }
            }
            if listeners.len() != n as usize {
                continue;
            }

            let servers = listeners
                .into_iter()
                .enumerate()
                .map(|(i, listener)| {
                    let port = base + i as u16;
                    let task = tokio::spawn(serve(listener, port, responder.clone(), log.clone()));
                    StubServer { port, task }
                })
                .collect();
            return (servers, log);
        }

        panic!("could not bind {} consecutive ports", n);
    }
}

#[derive(Clone)]
struct StubState {
    port: u16,
    responder: Responder,
    log: RequestLog,
}

async fn serve(listener: TcpListener, port: u16, responder: Responder, log: RequestLog) {
    let router = Router::new().fallback(answer).with_state(StubState {
        port,
        responder,
        log,
    });
    let _ = axum::serve(listener, router).await;
}

/// Status 0 holds the request open without ever answering
async fn answer(State(stub): State<StubState>, method: Method, uri: Uri, body: String) -> StatusCode {
    let mut request = StubRequest {
        port: stub.port,
        method: method.to_string(),
        path: uri.path().to_string(),
        body,
        status: 0,
    };
    request.status = (stub.responder)(&request);
    let status = request.status;
    stub.log.push(request);

    if status == 0 {
        std::future::pending::<()>().await;
    }
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
