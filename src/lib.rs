//! Stevedore - compose project lifecycle orchestration
//!
//! Stevedore turns a declarative multi-service project into ordered
//! container operations against a pluggable container runtime:
//!
//! - Compose file parsing, merging and interpolation
//! - Validation and dependency batch planning
//! - `up`, `stop`, `remove`, `pull` and `down` with retries and cancellation
//! - Status listings and log streaming
//! - An in-memory runtime for tests and dry runs

pub mod compose;
pub mod container;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod reporter;

pub use compose::{Project, ProjectOptions};
pub use container::{ContainerRuntime, MemoryRuntime};
pub use error::{Result, StevedoreError};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use reporter::Reporter;
