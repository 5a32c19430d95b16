//! Compose project model
//!
//! Parsing, validation and dependency planning for multi-service projects.

pub mod config;
pub mod parser;
pub mod plan;
pub mod project;

pub use config::{ComposeConfig, ServiceConfig};
pub use parser::ComposeParser;
pub use plan::OperationPlan;
pub use project::{
    PortBinding, Project, ProjectOptions, Protocol, RestartPolicy, ServiceSpec,
    DEFAULT_PROJECT_NAME,
};
