//! Status and log reporting
//!
//! Read-only views of a project's containers: status listings, per-container
//! logs with tail and follow, merged project logs, and the log hub that
//! attached `up` calls publish into.

pub mod logs;
pub mod view;

pub use logs::{LogHub, LogLine, LogLineStream, LogOptions};
pub use view::ContainerView;

use crate::compose::Project;
use crate::container::{AdapterResult, ContainerHandle, ContainerRuntime, ContainerState, LogStream};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const MERGED_CHANNEL_CAPACITY: usize = 256;

/// Status and log reporter over a container runtime
#[derive(Clone)]
pub struct Reporter {
    runtime: Arc<dyn ContainerRuntime>,
    hub: Arc<LogHub>,
}

impl Reporter {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            hub: Arc::new(LogHub::new()),
        }
    }

    /// Receive the log lines that attached `up` calls publish for a project
    pub async fn subscribe(&self, project: &str) -> broadcast::Receiver<LogLine> {
        self.hub.subscribe(project).await
    }

    pub fn hub(&self) -> &LogHub {
        &self.hub
    }

    /// Status of a project's containers.
    ///
    /// Only running containers unless `include_all`. Rows are ordered by
    /// start batch, then service, then container name.
    pub async fn list(&self, project: &Project, include_all: bool) -> AdapterResult<Vec<ContainerView>> {
        let handles = self.runtime.list(project.name()).await?;

        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            if !include_all && !handle.is_running() {
                continue;
            }
            match self.runtime.inspect(&handle).await {
                Ok(inspect) => {
                    if include_all || inspect.state == ContainerState::Running {
                        views.push(ContainerView::new(&handle, &inspect));
                    }
                }
                // Removed between listing and inspection
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        let plan = project.plan();
        views.sort_by(|a, b| {
            let rank = |v: &ContainerView| plan.batch_of(&v.service).unwrap_or(usize::MAX);
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.service.cmp(&b.service))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(views)
    }

    /// Read a container's logs.
    ///
    /// The finite history is read first and cut to the last `tail` records.
    /// In follow mode the stream then continues with records written after
    /// that history, until the container exits or the stream is dropped.
    pub async fn logs(&self, handle: &ContainerHandle, options: &LogOptions) -> AdapterResult<LogStream> {
        let history: Vec<_> = self.runtime.stream_logs(handle, false).await?.collect().await;
        let seen = history.len();
        let start = options.tail.map_or(0, |tail| seen.saturating_sub(tail));
        let head = tokio_stream::iter(history.into_iter().skip(start));

        if !options.follow {
            return Ok(Box::pin(head));
        }

        // Logs are append-only, so the first `seen` followed records are the history
        let live = self.runtime.stream_logs(handle, true).await?.skip(seen);
        Ok(Box::pin(head.chain(live)))
    }

    /// Logs of every container of a project, merged as they arrive
    pub async fn project_logs(&self, project: &Project, options: &LogOptions) -> AdapterResult<LogLineStream> {
        let handles = self.runtime.list(project.name()).await?;

        let mut streams = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.logs(&handle, options).await {
                Ok(stream) => streams.push((handle, stream)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(merge(streams))
    }

    /// Publish follow-mode logs of `handles` into the project's hub channel
    /// until every stream ends or `cancel` fires. Returns the number of lines
    /// forwarded.
    pub async fn attach(
        &self,
        project: &str,
        handles: &[ContainerHandle],
        cancel: &CancellationToken,
    ) -> usize {
        let sender = self.hub.sender(project).await;

        let mut streams = Vec::with_capacity(handles.len());
        for handle in handles {
            match self.runtime.stream_logs(handle, true).await {
                Ok(stream) => streams.push((handle.clone(), stream)),
                Err(e) => {
                    tracing::warn!(container = %handle.name, error = %e, "Cannot attach to container logs");
                }
            }
        }

        let mut merged = merge(streams);
        let mut forwarded = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(project, forwarded, "Log attachment cancelled");
                    break;
                }
                line = merged.next() => match line {
                    Some(line) => {
                        // No subscribers is fine; lines are simply dropped
                        let _ = sender.send(line);
                        forwarded += 1;
                    }
                    None => break,
                },
            }
        }
        forwarded
    }
}

/// Fan several container streams into one line stream.
///
/// Each input is drained by its own task; dropping the merged stream closes
/// the channel, which ends those tasks and drops their inputs.
fn merge(streams: Vec<(ContainerHandle, LogStream)>) -> LogLineStream {
    let (tx, rx) = mpsc::channel(MERGED_CHANNEL_CAPACITY);

    for (handle, mut stream) in streams {
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    record = stream.next() => match record {
                        Some(record) => {
                            if tx.send(LogLine::from_record(&handle, &record)).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }
            }
        });
    }

    Box::pin(ReceiverStream::new(rx))
}
