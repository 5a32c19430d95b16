//! Container handle, state and log record types

use crate::compose::PortBinding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container is created but not running
    Created,
    /// Container is running
    Running,
    /// Container has stopped
    Stopped,
    /// Container has been removed
    Removed,
    /// Container exited abnormally or failed to start
    Failed,
}

impl ContainerState {
    /// Running or failed: a started container has settled
    pub fn is_settled(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Failed)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Removed => write!(f, "removed"),
            ContainerState::Failed => write!(f, "failed"),
        }
    }
}

/// The orchestrator's reference to a created container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    /// Opaque runtime ID
    pub id: String,
    /// Container name (`{project}-{service}-{replica}`)
    pub name: String,
    /// Owning project
    pub project: String,
    /// Owning service
    pub service: String,
    /// Last recorded state
    pub state: ContainerState,
}

impl ContainerHandle {
    /// First 12 characters of the ID
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// Runtime view of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub state: ContainerState,
    pub image: String,
    pub command: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub exit_code: Option<i32>,
}

/// Output stream a log record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

/// A chunk of container output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub container_id: String,
    pub stream: LogStreamKind,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(container_id: &str, stream: LogStreamKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            container_id: container_id.to_string(),
            stream,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// Payload as text, lossily decoded, without the trailing newline
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        let handle = ContainerHandle {
            id: "0123456789abcdef0123".to_string(),
            name: "p-web-1".to_string(),
            project: "p".to_string(),
            service: "web".to_string(),
            state: ContainerState::Created,
        };
        assert_eq!(handle.short_id(), "0123456789ab");

        let short = ContainerHandle {
            id: "abc".to_string(),
            ..handle
        };
        assert_eq!(short.short_id(), "abc");
    }

    #[test]
    fn test_record_text() {
        let record = LogRecord::new("c1", LogStreamKind::Stderr, b"oops\r\n".to_vec());
        assert_eq!(record.text(), "oops");

        let binary = LogRecord::new("c1", LogStreamKind::Stdout, vec![0xff, b'a']);
        assert_eq!(binary.text(), "\u{fffd}a");
    }

    #[test]
    fn test_settled_states() {
        assert!(ContainerState::Running.is_settled());
        assert!(ContainerState::Failed.is_settled());
        assert!(!ContainerState::Created.is_settled());
        assert_eq!(ContainerState::Stopped.to_string(), "stopped");
    }
}
