//! Lifecycle orchestrator
//!
//! Drives a [`ContainerRuntime`] through `up`, `stop`, `remove`, `pull` and
//! `down` for a validated [`Project`]. Services inside a batch run
//! concurrently; batches run one after another, in plan order for `up` and
//! in reverse for teardown.

pub mod config;
mod lifecycle;
pub mod registry;
pub mod retry;

pub use config::{OrchestratorConfig, RetryConfig};
pub use registry::HandleRegistry;
pub use retry::RetryPolicy;

use crate::compose::Project;
use crate::container::{ContainerHandle, ContainerRuntime};
use crate::error::{AdapterError, OrchestrationError, Result, ServiceFailure};
use crate::reporter::Reporter;
use lifecycle::{run_batch, Executor};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Result of a lifecycle operation
pub type OrchestrationResult<T> = std::result::Result<T, OrchestrationError>;

/// Options for [`Orchestrator::up`]
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Block and publish container logs to the reporter's hub after starting
    pub attach_logs: bool,
    pub cancel: CancellationToken,
}

impl UpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_logs(mut self, attach: bool) -> Self {
        self.attach_logs = attach;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Options for [`Orchestrator::stop`]
#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    /// Grace period for every container, overriding service and default values
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl StopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Options for [`Orchestrator::remove`]
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Kill running containers instead of refusing
    pub force: bool,
    pub cancel: CancellationToken,
}

impl RemoveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Options for [`Orchestrator::pull`]
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub cancel: CancellationToken,
}

/// Compose project orchestrator
pub struct Orchestrator {
    exec: Executor,
    reporter: Reporter,
}

impl Orchestrator {
    /// Create an orchestrator over a runtime. Fails on invalid configuration.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            reporter: Reporter::new(runtime.clone()),
            exec: Executor::new(runtime, config),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.exec.config
    }

    /// Status and log reporter over the same runtime
    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Handles this orchestrator currently tracks for a project
    pub async fn handles(&self, project: &Project) -> Vec<ContainerHandle> {
        self.exec.registry.for_project(project.name()).await
    }

    /// Create and start every service, batch by batch.
    ///
    /// A failure halts later batches; containers started by earlier batches
    /// keep running. Cancellation is honoured between batches, after the
    /// current batch's containers have settled.
    pub async fn up(&self, project: &Project, options: &UpOptions) -> OrchestrationResult<Vec<ContainerHandle>> {
        tracing::info!(project = project.name(), services = project.len(), "Starting project");

        let existing = self.list(project).await?;
        let batches = project.plan().batches();
        let mut completed = Vec::new();
        let mut handles = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            if options.cancel.is_cancelled() {
                return Err(cancelled(project, completed, &batches[index..]));
            }
            tracing::debug!(project = project.name(), batch = index, services = ?batch, "Starting batch");

            let tasks = batch
                .iter()
                .filter_map(|name| project.service(name))
                .map(|spec| {
                    let exec = self.exec.clone();
                    let spec = spec.clone();
                    let project_name = project.name().to_string();
                    let current: Vec<ContainerHandle> = existing
                        .iter()
                        .filter(|h| h.service == spec.name)
                        .cloned()
                        .collect();
                    let name = spec.name.clone();
                    let task = async move { exec.ensure_service(&project_name, &spec, &current).await };
                    (name, task)
                })
                .collect();

            let report = run_batch(tasks).await;
            completed.extend(report.succeeded);
            handles.extend(report.handles);

            if !report.failed.is_empty() {
                let skipped = batches[index + 1..].iter().flatten().cloned().collect();
                return Err(self.start_failure(completed, report.failed, skipped));
            }
        }

        tracing::info!(project = project.name(), containers = handles.len(), "Project started");

        if options.attach_logs {
            let forwarded = self
                .reporter
                .attach(project.name(), &handles, &options.cancel)
                .await;
            tracing::debug!(project = project.name(), forwarded, "Log attachment ended");
        }

        Ok(handles)
    }

    /// Stop running containers, dependents first.
    ///
    /// Each container gets its grace period (explicit option, then the
    /// service's `stop_grace_period`, then the configured default) before it
    /// is killed. Containers that are not running are left alone.
    pub async fn stop(&self, project: &Project, options: &StopOptions) -> OrchestrationResult<()> {
        tracing::info!(project = project.name(), "Stopping project");

        let containers = self.list(project).await?;
        let batches: Vec<Vec<String>> = project.plan().reversed().cloned().collect();
        let mut completed = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            if options.cancel.is_cancelled() {
                return Err(cancelled(project, completed, &batches[index..]));
            }

            let tasks = batch
                .iter()
                .filter_map(|name| project.service(name))
                .map(|spec| {
                    let grace = options
                        .timeout
                        .or(spec.stop_grace_period)
                        .unwrap_or_else(|| self.exec.config.stop_timeout());
                    let exec = self.exec.clone();
                    let mine = owned_by(&containers, &spec.name);
                    (spec.name.clone(), async move { exec.stop_service(mine, grace).await })
                })
                .collect();

            let report = run_batch(tasks).await;
            completed.extend(report.succeeded);

            if !report.failed.is_empty() {
                let skipped = batches[index + 1..].iter().flatten().cloned().collect();
                return Err(OrchestrationError::from_outcome(completed, report.failed, skipped));
            }
        }

        tracing::info!(project = project.name(), "Project stopped");
        Ok(())
    }

    /// Remove the project's containers, dependents first.
    ///
    /// Without `force`, any running container of a declared service fails
    /// the call before anything is removed. Orphans are left alone.
    pub async fn remove(&self, project: &Project, options: &RemoveOptions) -> OrchestrationResult<()> {
        tracing::info!(project = project.name(), force = options.force, "Removing project");

        let containers = self.list(project).await?;
        if !options.force {
            let declared: HashSet<&str> = project.service_names().collect();
            let running: Vec<String> = containers
                .iter()
                .filter(|h| h.is_running() && declared.contains(h.service.as_str()))
                .map(|h| h.name.clone())
                .collect();
            if !running.is_empty() {
                return Err(OrchestrationError::StillRunning { containers: running });
            }
        }

        let batches: Vec<Vec<String>> = project.plan().reversed().cloned().collect();
        let mut completed = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            if options.cancel.is_cancelled() {
                return Err(cancelled(project, completed, &batches[index..]));
            }

            let tasks = batch
                .iter()
                .filter_map(|name| project.service(name))
                .map(|spec| {
                    let exec = self.exec.clone();
                    let mine = owned_by(&containers, &spec.name);
                    let force = options.force;
                    (spec.name.clone(), async move { exec.remove_service(mine, force).await })
                })
                .collect();

            let report = run_batch(tasks).await;
            completed.extend(report.succeeded);

            if !report.failed.is_empty() {
                let skipped = batches[index + 1..].iter().flatten().cloned().collect();
                return Err(OrchestrationError::from_outcome(completed, report.failed, skipped));
            }
        }

        tracing::info!(project = project.name(), "Project removed");
        Ok(())
    }

    /// Pull every distinct image, at most `pull_concurrency` at a time.
    ///
    /// A permanent failure stops new pulls from being scheduled; pulls
    /// already running finish, and the rest are reported as skipped.
    /// Outcomes name the services using each image.
    pub async fn pull(&self, project: &Project, options: &PullOptions) -> OrchestrationResult<()> {
        let mut users: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for spec in project.services() {
            users.entry(spec.image.as_str()).or_default().push(spec.name.clone());
        }
        let concurrency = self.exec.config.pull_concurrency;
        tracing::info!(project = project.name(), images = users.len(), concurrency, "Pulling images");

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let halt = options.cancel.child_token();
        let mut set = JoinSet::new();
        let mut scheduled = Vec::new();
        let mut skipped = Vec::new();

        for (image, services) in &users {
            let permit = tokio::select! {
                biased;
                _ = halt.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                skipped.extend(services.iter().cloned());
                continue;
            };

            let exec = self.exec.clone();
            let image = image.to_string();
            let halt = halt.clone();
            scheduled.push(image.clone());
            set.spawn(async move {
                let result = exec.pull(&image).await;
                drop(permit);
                if let Err(e) = &result {
                    if !e.is_transient() {
                        tracing::warn!(image = %image, error = %e, "Pull failed, halting further pulls");
                        halt.cancel();
                    }
                }
                (image, result)
            });
        }

        let mut outcomes: HashMap<String, std::result::Result<(), AdapterError>> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((image, result)) => {
                    outcomes.insert(image, result);
                }
                Err(e) => tracing::error!(error = %e, "Pull task aborted"),
            }
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for image in scheduled {
            let services = users.get(image.as_str()).map_or(&[][..], Vec::as_slice);
            let cause = match outcomes.remove(&image) {
                Some(Ok(())) => {
                    succeeded.extend(services.iter().cloned());
                    continue;
                }
                Some(Err(cause)) => cause,
                None => AdapterError::Permanent("task panicked".to_string()),
            };
            failed.extend(services.iter().map(|service| ServiceFailure {
                service: service.clone(),
                cause: cause.clone(),
            }));
        }
        succeeded.sort();
        failed.sort_by(|a, b| a.service.cmp(&b.service));
        skipped.sort();

        if options.cancel.is_cancelled() && !skipped.is_empty() {
            tracing::warn!(project = project.name(), pending = skipped.len(), "Pull cancelled");
            return Err(OrchestrationError::Cancelled {
                completed: succeeded,
                pending: skipped,
            });
        }
        if !failed.is_empty() {
            return Err(OrchestrationError::from_outcome(succeeded, failed, skipped));
        }

        tracing::info!(project = project.name(), pulled = users.len(), "Images pulled");
        Ok(())
    }

    /// Stop, then remove
    pub async fn down(&self, project: &Project, force: bool) -> OrchestrationResult<()> {
        self.stop(project, &StopOptions::new()).await?;
        self.remove(project, &RemoveOptions::new().force(force)).await
    }

    async fn list(&self, project: &Project) -> OrchestrationResult<Vec<ContainerHandle>> {
        self.exec
            .list(project.name())
            .await
            .map_err(|cause| OrchestrationError::Adapter {
                service: project.name().to_string(),
                cause,
            })
    }

    /// A lone start timeout is reported as such; anything else by outcome
    fn start_failure(
        &self,
        completed: Vec<String>,
        failed: Vec<ServiceFailure>,
        skipped: Vec<String>,
    ) -> OrchestrationError {
        if let [ServiceFailure {
            service,
            cause: AdapterError::Timeout(_),
        }] = failed.as_slice()
        {
            if completed.is_empty() {
                return OrchestrationError::Timeout {
                    service: service.clone(),
                    after: self.exec.config.start_timeout(),
                };
            }
        }
        OrchestrationError::from_outcome(completed, failed, skipped)
    }
}

fn owned_by(containers: &[ContainerHandle], service: &str) -> Vec<ContainerHandle> {
    containers
        .iter()
        .filter(|h| h.service == service)
        .cloned()
        .collect()
}

fn cancelled(project: &Project, completed: Vec<String>, remaining: &[Vec<String>]) -> OrchestrationError {
    let pending: Vec<String> = remaining.iter().flatten().cloned().collect();
    tracing::warn!(project = project.name(), pending = pending.len(), "Operation cancelled");
    OrchestrationError::Cancelled { completed, pending }
}
