//! Container runtime boundary
//!
//! The orchestrator only talks to a container engine through
//! [`ContainerRuntime`]. Transport (local socket, HTTP API, subprocess) is the
//! implementor's business. Every call returns an explicit result; a missing
//! container or image is [`AdapterError::NotFound`].

use super::config::{ContainerHandle, ContainerInspect, LogRecord};
use crate::compose::ServiceSpec;
use crate::error::AdapterError;
use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;

/// Result of a runtime call
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Lazy sequence of log records. Dropping it stops the producer.
pub type LogStream = Pin<Box<dyn Stream<Item = LogRecord> + Send>>;

/// Operations a container engine must provide
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) the container for one service replica.
    ///
    /// Fails with `NotFound` when the image is not present locally.
    async fn create(
        &self,
        project: &str,
        spec: &ServiceSpec,
        replica: u32,
    ) -> AdapterResult<ContainerHandle>;

    /// Start a created or stopped container.
    ///
    /// Must not return `Ok` until the runtime has applied the start: an
    /// `inspect` issued afterwards may report `Running` or a fresh exit, but
    /// never the state the container was in before the call.
    async fn start(&self, handle: &ContainerHandle) -> AdapterResult<()>;

    /// Ask a container to stop, waiting at most `timeout`.
    ///
    /// Returns `Timeout` if the container is still running afterwards.
    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> AdapterResult<()>;

    /// Terminate a container immediately
    async fn kill(&self, handle: &ContainerHandle) -> AdapterResult<()>;

    /// Remove a container; `force` kills it first if it is running
    async fn remove(&self, handle: &ContainerHandle, force: bool) -> AdapterResult<()>;

    async fn inspect(&self, handle: &ContainerHandle) -> AdapterResult<ContainerInspect>;

    async fn pull_image(&self, reference: &str) -> AdapterResult<()>;

    /// Stream a container's output from the beginning.
    ///
    /// Without `follow` the stream ends after the records written so far.
    /// With `follow` it continues with new records until the container exits
    /// or the stream is dropped.
    async fn stream_logs(&self, handle: &ContainerHandle, follow: bool) -> AdapterResult<LogStream>;

    /// All containers labelled with `project`, with their current state
    async fn list(&self, project: &str) -> AdapterResult<Vec<ContainerHandle>>;
}
