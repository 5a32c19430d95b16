//! In-process container runtime
//!
//! `MemoryRuntime` implements [`ContainerRuntime`] without a real engine:
//! containers are records in a map, images are names in a set and logs are
//! append-only vectors. It also journals every call and can inject faults,
//! which makes it the runtime of choice for tests and dry runs.

use super::adapter::{AdapterResult, ContainerRuntime, LogStream};
use super::config::{ContainerHandle, ContainerInspect, ContainerState, LogRecord, LogStreamKind};
use crate::compose::{PortBinding, ServiceSpec};
use crate::error::AdapterError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Exit code reported for killed containers
const KILLED_EXIT_CODE: i32 = 137;

/// Exit code reported for containers that crash on start
const CRASHED_EXIT_CODE: i32 = 1;

const LOG_CHANNEL_CAPACITY: usize = 256;

/// Runtime operation, as recorded in the call journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    Create,
    Start,
    Stop,
    Kill,
    Remove,
    Inspect,
    Pull,
    Logs,
    List,
}

/// One journaled runtime call
#[derive(Debug, Clone)]
pub struct RuntimeCall {
    pub op: RuntimeOp,
    /// Container name, image reference or project name
    pub target: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
enum LogEvent {
    Record(LogRecord),
    Exited,
}

#[derive(Debug)]
struct ContainerRecord {
    handle: ContainerHandle,
    image: String,
    command: Vec<String>,
    ports: Vec<PortBinding>,
    exit_code: Option<i32>,
    logs: Vec<LogRecord>,
    events: broadcast::Sender<LogEvent>,
}

impl ContainerRecord {
    fn append_log(&mut self, stream: LogStreamKind, text: &str) {
        let record = LogRecord::new(&self.handle.id, stream, format!("{}\n", text));
        self.logs.push(record.clone());
        let _ = self.events.send(LogEvent::Record(record));
    }

    fn exit(&mut self, state: ContainerState, exit_code: i32) {
        self.handle.state = state;
        self.exit_code = Some(exit_code);
        let _ = self.events.send(LogEvent::Exited);
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Remaining transient failures per operation
    transient: HashMap<RuntimeOp, u32>,
    /// Services whose start call fails permanently
    start_failures: HashSet<String>,
    /// Services whose containers exit right after starting
    crash_on_start: HashSet<String>,
    /// Services whose containers ignore graceful stop
    ignore_stop: HashSet<String>,
}

/// In-memory container runtime
#[derive(Debug)]
pub struct MemoryRuntime {
    containers: RwLock<HashMap<String, ContainerRecord>>,
    local_images: RwLock<HashSet<String>>,
    remote_images: RwLock<HashSet<String>>,
    faults: Mutex<Faults>,
    journal: Mutex<Vec<RuntimeCall>>,
    pull_delay: Duration,
    pulls_in_flight: AtomicUsize,
    max_pulls_in_flight: AtomicUsize,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    /// Create an empty runtime with no images
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            local_images: RwLock::new(HashSet::new()),
            remote_images: RwLock::new(HashSet::new()),
            faults: Mutex::new(Faults::default()),
            journal: Mutex::new(Vec::new()),
            pull_delay: Duration::ZERO,
            pulls_in_flight: AtomicUsize::new(0),
            max_pulls_in_flight: AtomicUsize::new(0),
        }
    }

    /// Mark an image as present locally
    pub fn with_image(self, image: &str) -> Self {
        if let Ok(mut images) = self.local_images.write() {
            images.insert(image.to_string());
        }
        self
    }

    /// Mark an image as pullable from the registry
    pub fn with_remote_image(self, image: &str) -> Self {
        if let Ok(mut images) = self.remote_images.write() {
            images.insert(image.to_string());
        }
        self
    }

    /// Make every pull take `delay`
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    /// Fail the next `count` calls of `op` with a transient error
    pub fn fail_transiently(&self, op: RuntimeOp, count: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults.transient.entry(op).or_insert(0) += count;
        }
    }

    /// Make every start of `service` fail permanently
    pub fn fail_start(&self, service: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.start_failures.insert(service.to_string());
        }
    }

    /// Make containers of `service` exit with an error right after starting
    pub fn crash_on_start(&self, service: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.crash_on_start.insert(service.to_string());
        }
    }

    /// Make containers of `service` ignore graceful stop requests
    pub fn ignore_stop(&self, service: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.ignore_stop.insert(service.to_string());
        }
    }

    /// Write a line to a container's output
    pub fn emit_log(&self, container_id: &str, stream: LogStreamKind, text: &str) -> AdapterResult<()> {
        let mut containers = self.containers_mut()?;
        let record = containers
            .get_mut(container_id)
            .ok_or_else(|| AdapterError::NotFound(format!("No such container: {}", container_id)))?;
        record.append_log(stream, text);
        Ok(())
    }

    /// Simulate a running container exiting on its own
    pub fn exit_container(&self, container_id: &str, exit_code: i32) -> AdapterResult<()> {
        let mut containers = self.containers_mut()?;
        let record = containers
            .get_mut(container_id)
            .ok_or_else(|| AdapterError::NotFound(format!("No such container: {}", container_id)))?;
        let state = if exit_code == 0 {
            ContainerState::Stopped
        } else {
            ContainerState::Failed
        };
        record.exit(state, exit_code);
        Ok(())
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Calls of one operation, in order
    pub fn calls_of(&self, op: RuntimeOp) -> Vec<RuntimeCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Highest number of pulls that were in flight at the same time
    pub fn max_concurrent_pulls(&self) -> usize {
        self.max_pulls_in_flight.load(Ordering::SeqCst)
    }

    /// Number of containers currently known to the runtime
    pub fn container_count(&self) -> usize {
        self.containers.read().map(|c| c.len()).unwrap_or(0)
    }

    /// State of a container, if it exists
    pub fn state_of(&self, container_id: &str) -> Option<ContainerState> {
        self.containers
            .read()
            .ok()?
            .get(container_id)
            .map(|r| r.handle.state)
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.local_images
            .read()
            .map(|i| i.contains(image))
            .unwrap_or(false)
    }

    fn containers(&self) -> AdapterResult<RwLockReadGuard<'_, HashMap<String, ContainerRecord>>> {
        self.containers
            .read()
            .map_err(|_| AdapterError::Permanent("Failed to acquire read lock".to_string()))
    }

    fn containers_mut(&self) -> AdapterResult<RwLockWriteGuard<'_, HashMap<String, ContainerRecord>>> {
        self.containers
            .write()
            .map_err(|_| AdapterError::Permanent("Failed to acquire write lock".to_string()))
    }

    fn faults(&self) -> AdapterResult<MutexGuard<'_, Faults>> {
        self.faults
            .lock()
            .map_err(|_| AdapterError::Permanent("Failed to acquire fault lock".to_string()))
    }

    /// Journal the call and apply any pending transient fault
    fn enter(&self, op: RuntimeOp, target: &str) -> AdapterResult<()> {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(RuntimeCall {
                op,
                target: target.to_string(),
                at: Instant::now(),
            });
        }

        let mut faults = self.faults()?;
        if let Some(remaining) = faults.transient.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AdapterError::Transient(format!(
                    "connection reset during {:?} of {}",
                    op, target
                )));
            }
        }
        Ok(())
    }

    fn not_found(id: &str) -> AdapterError {
        AdapterError::NotFound(format!("No such container: {}", id))
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create(
        &self,
        project: &str,
        spec: &ServiceSpec,
        replica: u32,
    ) -> AdapterResult<ContainerHandle> {
        let name = spec.container_name(project, replica);
        self.enter(RuntimeOp::Create, &name)?;

        if !self.has_image(&spec.image) {
            return Err(AdapterError::NotFound(format!("No such image: {}", spec.image)));
        }

        let mut containers = self.containers_mut()?;
        if containers.values().any(|r| r.handle.name == name) {
            return Err(AdapterError::Permanent(format!(
                "Conflict: container name {} is already in use",
                name
            )));
        }

        let handle = ContainerHandle {
            id: Uuid::new_v4().simple().to_string(),
            name,
            project: project.to_string(),
            service: spec.name.clone(),
            state: ContainerState::Created,
        };
        let (events, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);

        containers.insert(
            handle.id.clone(),
            ContainerRecord {
                handle: handle.clone(),
                image: spec.image.clone(),
                command: spec.command.clone(),
                ports: spec.ports.clone(),
                exit_code: None,
                logs: Vec::new(),
                events,
            },
        );

        Ok(handle)
    }

    async fn start(&self, handle: &ContainerHandle) -> AdapterResult<()> {
        self.enter(RuntimeOp::Start, &handle.name)?;

        let (fails, crashes) = {
            let faults = self.faults()?;
            (
                faults.start_failures.contains(&handle.service),
                faults.crash_on_start.contains(&handle.service),
            )
        };

        let mut containers = self.containers_mut()?;
        let record = containers
            .get_mut(&handle.id)
            .ok_or_else(|| Self::not_found(&handle.id))?;

        if record.handle.state == ContainerState::Running {
            return Ok(());
        }
        if fails {
            return Err(AdapterError::Permanent(format!(
                "failed to start container {}",
                handle.name
            )));
        }

        record.handle.state = ContainerState::Running;
        record.exit_code = None;
        let started = format!("starting {}", record.image);
        record.append_log(LogStreamKind::Stdout, &started);

        if crashes {
            record.append_log(LogStreamKind::Stderr, "fatal: process exited");
            record.exit(ContainerState::Failed, CRASHED_EXIT_CODE);
        }

        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> AdapterResult<()> {
        self.enter(RuntimeOp::Stop, &handle.name)?;

        let ignores = self.faults()?.ignore_stop.contains(&handle.service);
        {
            let mut containers = self.containers_mut()?;
            let record = containers
                .get_mut(&handle.id)
                .ok_or_else(|| Self::not_found(&handle.id))?;

            if record.handle.state != ContainerState::Running {
                return Ok(());
            }
            if !ignores {
                record.exit(ContainerState::Stopped, 0);
                return Ok(());
            }
        }

        tokio::time::sleep(timeout).await;
        Err(AdapterError::Timeout(format!(
            "container {} did not stop within {:?}",
            handle.name, timeout
        )))
    }

    async fn kill(&self, handle: &ContainerHandle) -> AdapterResult<()> {
        self.enter(RuntimeOp::Kill, &handle.name)?;

        let mut containers = self.containers_mut()?;
        let record = containers
            .get_mut(&handle.id)
            .ok_or_else(|| Self::not_found(&handle.id))?;

        if record.handle.state == ContainerState::Running {
            record.exit(ContainerState::Stopped, KILLED_EXIT_CODE);
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> AdapterResult<()> {
        self.enter(RuntimeOp::Remove, &handle.name)?;

        let mut containers = self.containers_mut()?;
        let record = containers
            .get_mut(&handle.id)
            .ok_or_else(|| Self::not_found(&handle.id))?;

        if record.handle.state == ContainerState::Running {
            if !force {
                return Err(AdapterError::Permanent(format!(
                    "cannot remove running container {}",
                    handle.name
                )));
            }
            record.exit(ContainerState::Stopped, KILLED_EXIT_CODE);
        }

        containers.remove(&handle.id);
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> AdapterResult<ContainerInspect> {
        self.enter(RuntimeOp::Inspect, &handle.name)?;

        let containers = self.containers()?;
        let record = containers
            .get(&handle.id)
            .ok_or_else(|| Self::not_found(&handle.id))?;

        Ok(ContainerInspect {
            state: record.handle.state,
            image: record.image.clone(),
            command: record.command.clone(),
            ports: record.ports.clone(),
            exit_code: record.exit_code,
        })
    }

    async fn pull_image(&self, reference: &str) -> AdapterResult<()> {
        self.enter(RuntimeOp::Pull, reference)?;

        let in_flight = self.pulls_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_pulls_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }
        self.pulls_in_flight.fetch_sub(1, Ordering::SeqCst);

        let available = self
            .remote_images
            .read()
            .map(|images| images.contains(reference))
            .unwrap_or(false);
        if !available {
            return Err(AdapterError::Permanent(format!(
                "pull access denied for {}: repository does not exist",
                reference
            )));
        }

        self.local_images
            .write()
            .map_err(|_| AdapterError::Permanent("Failed to acquire image lock".to_string()))?
            .insert(reference.to_string());
        Ok(())
    }

    async fn stream_logs(&self, handle: &ContainerHandle, follow: bool) -> AdapterResult<LogStream> {
        self.enter(RuntimeOp::Logs, &handle.name)?;

        // Snapshot and subscribe under one lock so no record is missed or doubled
        let (history, live) = {
            let containers = self.containers()?;
            let record = containers
                .get(&handle.id)
                .ok_or_else(|| Self::not_found(&handle.id))?;
            let live = (follow && record.handle.state == ContainerState::Running)
                .then(|| record.events.subscribe());
            (record.logs.clone(), live)
        };

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for record in history {
                if tx.send(record).await.is_err() {
                    return;
                }
            }

            let Some(mut events) = live else { return };
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    event = events.recv() => match event {
                        Ok(LogEvent::Record(record)) => {
                            if tx.send(record).await.is_err() {
                                return;
                            }
                        }
                        Ok(LogEvent::Exited) | Err(broadcast::error::RecvError::Closed) => return,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Log follower lagged, records dropped");
                        }
                    },
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list(&self, project: &str) -> AdapterResult<Vec<ContainerHandle>> {
        self.enter(RuntimeOp::List, project)?;

        let containers = self.containers()?;
        let mut handles: Vec<ContainerHandle> = containers
            .values()
            .filter(|r| r.handle.project == project)
            .map(|r| r.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::{ComposeConfig, Project, ProjectOptions, ServiceConfig};
    use tokio_stream::StreamExt;

    fn web_spec() -> ServiceSpec {
        let config = ComposeConfig::default().with_service("web", ServiceConfig::new("nginx"));
        let project = Project::load(&config, &ProjectOptions::new()).unwrap();
        project.service("web").unwrap().clone()
    }

    #[tokio::test]
    async fn test_create_requires_local_image() {
        let runtime = MemoryRuntime::new().with_remote_image("nginx");
        let spec = web_spec();

        let err = runtime.create("p", &spec, 1).await.unwrap_err();
        assert!(err.is_not_found());

        runtime.pull_image("nginx").await.unwrap();
        let handle = runtime.create("p", &spec, 1).await.unwrap();
        assert_eq!(handle.name, "p-web-1");
        assert_eq!(handle.state, ContainerState::Created);
    }

    #[tokio::test]
    async fn test_pull_unknown_image_is_permanent() {
        let runtime = MemoryRuntime::new();
        let err = runtime.pull_image("ghost").await.unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        let handle = runtime.create("p", &web_spec(), 1).await.unwrap();

        runtime.start(&handle).await.unwrap();
        assert_eq!(runtime.state_of(&handle.id), Some(ContainerState::Running));

        let err = runtime.remove(&handle, false).await.unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)));

        runtime.stop(&handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(runtime.inspect(&handle).await.unwrap().exit_code, Some(0));

        runtime.remove(&handle, false).await.unwrap();
        assert_eq!(runtime.container_count(), 0);
        assert!(runtime.inspect(&handle).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_name_conflict() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        runtime.create("p", &web_spec(), 1).await.unwrap();
        let err = runtime.create("p", &web_spec(), 1).await.unwrap_err();
        assert!(matches!(err, AdapterError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_transient_faults_are_consumed() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        runtime.fail_transiently(RuntimeOp::List, 1);

        assert!(runtime.list("p").await.unwrap_err().is_transient());
        assert!(runtime.list("p").await.unwrap().is_empty());
        assert_eq!(runtime.calls_of(RuntimeOp::List).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_when_ignored() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        runtime.ignore_stop("web");
        let handle = runtime.create("p", &web_spec(), 1).await.unwrap();
        runtime.start(&handle).await.unwrap();

        let err = runtime.stop(&handle, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));

        runtime.kill(&handle).await.unwrap();
        let inspect = runtime.inspect(&handle).await.unwrap();
        assert_eq!(inspect.state, ContainerState::Stopped);
        assert_eq!(inspect.exit_code, Some(KILLED_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_logs_history_and_follow() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        let handle = runtime.create("p", &web_spec(), 1).await.unwrap();
        runtime.start(&handle).await.unwrap();
        runtime.emit_log(&handle.id, LogStreamKind::Stdout, "ready").unwrap();

        let history: Vec<LogRecord> = runtime
            .stream_logs(&handle, false)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text(), "ready");

        let mut follow = runtime.stream_logs(&handle, true).await.unwrap();
        assert_eq!(follow.next().await.unwrap().text(), "starting nginx");
        assert_eq!(follow.next().await.unwrap().text(), "ready");

        runtime.emit_log(&handle.id, LogStreamKind::Stderr, "live").unwrap();
        let live = follow.next().await.unwrap();
        assert_eq!(live.text(), "live");
        assert_eq!(live.stream, LogStreamKind::Stderr);

        runtime.exit_container(&handle.id, 0).unwrap();
        assert!(follow.next().await.is_none());
    }

    #[tokio::test]
    async fn test_crash_on_start() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        runtime.crash_on_start("web");
        let handle = runtime.create("p", &web_spec(), 1).await.unwrap();

        runtime.start(&handle).await.unwrap();
        let inspect = runtime.inspect(&handle).await.unwrap();
        assert_eq!(inspect.state, ContainerState::Failed);
        assert_eq!(inspect.exit_code, Some(CRASHED_EXIT_CODE));
    }
}
