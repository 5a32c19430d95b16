//! Container runtime abstraction
//!
//! The [`ContainerRuntime`] trait is the boundary between orchestration and
//! a concrete container engine. [`MemoryRuntime`] is an in-process engine.

pub mod adapter;
pub mod config;
pub mod memory;

pub use adapter::{AdapterResult, ContainerRuntime, LogStream};
pub use config::{ContainerHandle, ContainerInspect, ContainerState, LogRecord, LogStreamKind};
pub use memory::{MemoryRuntime, RuntimeCall, RuntimeOp};
