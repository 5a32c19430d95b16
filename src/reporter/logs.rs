//! Log lines, log options and the per-project log hub

use crate::container::{ContainerHandle, LogRecord, LogStreamKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::Stream;

/// Capacity of each project's broadcast channel
const LOG_CHANNEL_CAPACITY: usize = 256;

/// Lazy sequence of formatted log lines
pub type LogLineStream = Pin<Box<dyn Stream<Item = LogLine> + Send>>;

/// Options for reading a container's logs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep streaming new records after the history
    pub follow: bool,
    /// Only the last `n` records of the history
    pub tail: Option<usize>,
}

impl LogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn tail(mut self, tail: usize) -> Self {
        self.tail = Some(tail);
        self
    }
}

/// A log record attributed to its container and service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub container: String,
    pub service: String,
    pub stream: LogStreamKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn from_record(handle: &ContainerHandle, record: &LogRecord) -> Self {
        Self {
            container: handle.name.clone(),
            service: handle.service.clone(),
            stream: record.stream,
            text: record.text(),
            timestamp: record.timestamp,
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.container, self.text)
    }
}

/// Broadcast channels of attached log lines, one per project
#[derive(Debug, Default)]
pub struct LogHub {
    channels: RwLock<HashMap<String, broadcast::Sender<LogLine>>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for a project, created on first use
    pub async fn sender(&self, project: &str) -> broadcast::Sender<LogLine> {
        if let Some(sender) = self.channels.read().await.get(project) {
            return sender.clone();
        }

        let mut channels = self.channels.write().await;
        channels
            .entry(project.to_string())
            .or_insert_with(|| broadcast::channel(LOG_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub async fn subscribe(&self, project: &str) -> broadcast::Receiver<LogLine> {
        self.sender(project).await.subscribe()
    }

    /// Drop channels nobody listens to
    pub async fn cleanup(&self) {
        self.channels
            .write()
            .await
            .retain(|_, sender| sender.receiver_count() > 0);
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }
}
