//! Per-container lifecycle steps and batch execution
//!
//! Each step locks the container's registry entry for the whole transition
//! and routes every runtime call through the retry policy.

use super::config::OrchestratorConfig;
use super::registry::HandleRegistry;
use super::retry::{with_backoff, RetryPolicy};
use crate::compose::ServiceSpec;
use crate::container::{
    AdapterResult, ContainerHandle, ContainerInspect, ContainerRuntime, ContainerState,
};
use crate::error::{AdapterError, ServiceFailure};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Extra time granted to a runtime stop call beyond the grace period
const STOP_MARGIN: Duration = Duration::from_secs(5);

/// Runtime access shared by every task of an operation
#[derive(Clone)]
pub(crate) struct Executor {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) registry: Arc<HandleRegistry>,
    pub(crate) config: Arc<OrchestratorConfig>,
    retry: RetryPolicy,
}

impl Executor {
    pub(crate) fn new(runtime: Arc<dyn ContainerRuntime>, config: OrchestratorConfig) -> Self {
        Self {
            runtime,
            registry: Arc::new(HandleRegistry::new()),
            retry: RetryPolicy::from(&config.retry),
            config: Arc::new(config),
        }
    }

    async fn call<T, F, Fut>(&self, operation: &str, subject: &str, call: F) -> AdapterResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        tracing::debug!(operation, subject, "Runtime call");
        with_backoff(&self.retry, operation, subject, call).await
    }

    pub(crate) async fn list(&self, project: &str) -> AdapterResult<Vec<ContainerHandle>> {
        let rt = self.runtime.as_ref();
        self.call("list", project, move || rt.list(project)).await
    }

    pub(crate) async fn pull(&self, image: &str) -> AdapterResult<()> {
        let rt = self.runtime.as_ref();
        tracing::info!(image, "Pulling image");
        self.call("pull", image, move || rt.pull_image(image)).await
    }

    /// Current state, or `None` once the runtime no longer knows the container
    async fn current_state(&self, handle: &ContainerHandle) -> AdapterResult<Option<ContainerState>> {
        let rt = self.runtime.as_ref();
        match self.call("inspect", &handle.name, move || rt.inspect(handle)).await {
            Ok(inspect) => Ok(Some(inspect.state)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Make sure every replica of a service exists and runs
    pub(crate) async fn ensure_service(
        &self,
        project: &str,
        spec: &ServiceSpec,
        existing: &[ContainerHandle],
    ) -> AdapterResult<Vec<ContainerHandle>> {
        let mut handles = Vec::with_capacity(spec.replicas as usize);
        for replica in 1..=spec.replicas {
            let name = spec.container_name(project, replica);
            let current = existing.iter().find(|h| h.name == name).cloned();
            handles.push(self.ensure_replica(project, spec, replica, current).await?);
        }
        Ok(handles)
    }

    async fn ensure_replica(
        &self,
        project: &str,
        spec: &ServiceSpec,
        replica: u32,
        existing: Option<ContainerHandle>,
    ) -> AdapterResult<ContainerHandle> {
        let handle = match existing {
            Some(handle) => handle,
            None => self.create(project, spec, replica).await?,
        };

        let entry = self.registry.entry(handle).await;
        let mut guard = entry.lock().await;
        let rt = self.runtime.as_ref();

        match self.current_state(&guard).await? {
            Some(ContainerState::Running) => {
                guard.state = ContainerState::Running;
                tracing::debug!(container = %guard.name, "Container already running");
                return Ok(guard.clone());
            }
            Some(state) => guard.state = state,
            None => {
                return Err(AdapterError::NotFound(format!(
                    "container {} disappeared",
                    guard.name
                )))
            }
        }

        tracing::info!(project, service = %spec.name, container = %guard.name, "Starting container");
        {
            let handle = &*guard;
            self.call("start", &handle.name, move || rt.start(handle)).await?;
        }

        let settled = self.wait_settled(&guard).await?;
        guard.state = settled.state;
        match (settled.state, settled.exit_code) {
            (ContainerState::Running, _) | (ContainerState::Stopped, Some(0)) => Ok(guard.clone()),
            (state, code) => Err(AdapterError::Permanent(format!(
                "container {} is {} after start (exit code {})",
                guard.name,
                state,
                code.map_or_else(|| "none".to_string(), |c| c.to_string())
            ))),
        }
    }

    async fn create(
        &self,
        project: &str,
        spec: &ServiceSpec,
        replica: u32,
    ) -> AdapterResult<ContainerHandle> {
        let rt = self.runtime.as_ref();
        let name = spec.container_name(project, replica);
        tracing::info!(project, service = %spec.name, container = %name, image = %spec.image, "Creating container");

        match self.call("create", &name, move || rt.create(project, spec, replica)).await {
            Err(e) if e.is_not_found() => {
                tracing::info!(image = %spec.image, "Image not present locally");
                self.pull(&spec.image).await?;
                self.call("create", &name, move || rt.create(project, spec, replica)).await
            }
            other => other,
        }
    }

    /// Poll until the container is running, failed or exited, bounded by the
    /// start timeout
    async fn wait_settled(&self, handle: &ContainerHandle) -> AdapterResult<ContainerInspect> {
        let limit = self.config.start_timeout();
        match tokio::time::timeout(limit, self.poll_state(handle)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(format!(
                "container {} not running after {:?}",
                handle.name, limit
            ))),
        }
    }

    /// `Stopped` counts as settled because `start` has already been applied
    /// when this runs, so any exit seen here is from the new run.
    async fn poll_state(&self, handle: &ContainerHandle) -> AdapterResult<ContainerInspect> {
        let rt = self.runtime.as_ref();
        loop {
            let inspect = self.call("inspect", &handle.name, move || rt.inspect(handle)).await?;
            if inspect.state.is_settled() || inspect.state == ContainerState::Stopped {
                return Ok(inspect);
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Stop every running container of a service; returns the ones stopped
    pub(crate) async fn stop_service(
        &self,
        containers: Vec<ContainerHandle>,
        grace: Duration,
    ) -> AdapterResult<Vec<ContainerHandle>> {
        let mut stopped = Vec::new();
        for handle in containers {
            if let Some(handle) = self.stop_container(handle, grace).await? {
                stopped.push(handle);
            }
        }
        Ok(stopped)
    }

    /// Graceful stop, escalating to kill after the grace period.
    /// Containers that are not running are left alone.
    async fn stop_container(
        &self,
        handle: ContainerHandle,
        grace: Duration,
    ) -> AdapterResult<Option<ContainerHandle>> {
        let entry = self.registry.entry(handle).await;
        let mut guard = entry.lock().await;
        let rt = self.runtime.as_ref();

        match self.current_state(&guard).await? {
            Some(state) => guard.state = state,
            None => {
                let id = guard.id.clone();
                drop(guard);
                self.registry.remove(&id).await;
                return Ok(None);
            }
        }
        if guard.state != ContainerState::Running {
            return Ok(None);
        }

        tracing::info!(
            container = %guard.name,
            grace_secs = grace.as_secs_f64(),
            "Stopping container"
        );
        let outcome = {
            let handle = &*guard;
            tokio::time::timeout(
                grace + STOP_MARGIN,
                self.call("stop", &handle.name, move || rt.stop(handle, grace)),
            )
            .await
        };

        let graceful = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(AdapterError::Timeout(_))) | Err(_) => false,
            Ok(Err(e)) if e.is_not_found() => true,
            Ok(Err(e)) => return Err(e),
        };

        if !graceful {
            tracing::warn!(container = %guard.name, "Container ignored stop, killing");
            let handle = &*guard;
            match self.call("kill", &handle.name, move || rt.kill(handle)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        guard.state = ContainerState::Stopped;
        Ok(Some(guard.clone()))
    }

    /// Remove every container of a service; returns the ones removed
    pub(crate) async fn remove_service(
        &self,
        containers: Vec<ContainerHandle>,
        force: bool,
    ) -> AdapterResult<Vec<ContainerHandle>> {
        let mut removed = Vec::new();
        for handle in containers {
            if let Some(handle) = self.remove_container(handle, force).await? {
                removed.push(handle);
            }
        }
        Ok(removed)
    }

    async fn remove_container(
        &self,
        handle: ContainerHandle,
        force: bool,
    ) -> AdapterResult<Option<ContainerHandle>> {
        let entry = self.registry.entry(handle).await;
        let mut guard = entry.lock().await;
        let rt = self.runtime.as_ref();

        let state = self.current_state(&guard).await?;
        if let Some(state) = state {
            guard.state = state;

            if state == ContainerState::Running {
                if !force {
                    return Err(AdapterError::Permanent(format!(
                        "container {} is running",
                        guard.name
                    )));
                }
                tracing::warn!(container = %guard.name, "Killing running container before removal");
                let handle = &*guard;
                match self.call("kill", &handle.name, move || rt.kill(handle)).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                guard.state = ContainerState::Stopped;
            }

            tracing::info!(container = %guard.name, "Removing container");
            let handle = &*guard;
            match self.call("remove", &handle.name, move || rt.remove(handle, force)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        guard.state = ContainerState::Removed;
        let removed = guard.clone();
        drop(guard);
        self.registry.remove(&removed.id).await;

        Ok(state.map(|_| removed))
    }
}

/// Outcome of one batch of concurrent service tasks
#[derive(Debug, Default)]
pub(crate) struct BatchReport {
    pub(crate) succeeded: Vec<String>,
    pub(crate) failed: Vec<ServiceFailure>,
    pub(crate) handles: Vec<ContainerHandle>,
}

/// Run one task per service concurrently and wait for all of them
pub(crate) async fn run_batch<Fut>(tasks: Vec<(String, Fut)>) -> BatchReport
where
    Fut: Future<Output = AdapterResult<Vec<ContainerHandle>>> + Send + 'static,
{
    let services: Vec<String> = tasks.iter().map(|(name, _)| name.clone()).collect();

    let mut set = JoinSet::new();
    for (service, task) in tasks {
        set.spawn(async move { (service, task.await) });
    }

    let mut report = BatchReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((service, Ok(handles))) => {
                report.succeeded.push(service);
                report.handles.extend(handles);
            }
            Ok((service, Err(cause))) => {
                tracing::error!(service = %service, error = %cause, "Service operation failed");
                report.failed.push(ServiceFailure { service, cause });
            }
            Err(e) => tracing::error!(error = %e, "Service task aborted"),
        }
    }

    // A task that panicked never reported its service
    let reported: HashSet<&str> = report
        .succeeded
        .iter()
        .map(String::as_str)
        .chain(report.failed.iter().map(|f| f.service.as_str()))
        .collect();
    let lost: Vec<String> = services
        .iter()
        .filter(|s| !reported.contains(s.as_str()))
        .cloned()
        .collect();
    for service in lost {
        report.failed.push(ServiceFailure {
            service,
            cause: AdapterError::Permanent("task panicked".to_string()),
        });
    }

    report.succeeded.sort();
    report.failed.sort_by(|a, b| a.service.cmp(&b.service));
    report.handles.sort_by(|a, b| a.name.cmp(&b.name));
    report
}
