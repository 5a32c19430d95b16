//! Container status views

use crate::container::{ContainerHandle, ContainerInspect, ContainerState};
use serde::{Deserialize, Serialize};

/// One row of a project's status listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerView {
    /// Short container ID
    pub id: String,
    pub name: String,
    pub service: String,
    pub image: String,
    /// Command line, space separated
    pub command: String,
    /// Human readable state, e.g. `running` or `exited (137)`
    pub status: String,
    pub state: ContainerState,
    /// Published ports, e.g. `0.0.0.0:8080->80/tcp`
    pub ports: Vec<String>,
}

impl ContainerView {
    pub fn new(handle: &ContainerHandle, inspect: &ContainerInspect) -> Self {
        Self {
            id: handle.short_id().to_string(),
            name: handle.name.clone(),
            service: handle.service.clone(),
            image: inspect.image.clone(),
            command: inspect.command.join(" "),
            status: status_text(inspect.state, inspect.exit_code),
            state: inspect.state,
            ports: inspect.ports.iter().map(|p| p.to_string()).collect(),
        }
    }
}

fn status_text(state: ContainerState, exit_code: Option<i32>) -> String {
    match (state, exit_code) {
        (ContainerState::Stopped, Some(code)) => format!("exited ({})", code),
        (ContainerState::Failed, Some(code)) => format!("failed ({})", code),
        (state, _) => state.to_string(),
    }
}
