//! Lifecycle orchestration for a single sandbox.
//!
//! [`Orchestrator`] boots the sandbox through a [`sandbox::SandboxFactory`],
//! attaches the [`bridge::Bridge`] to its guest channel and brings up the
//! dependent services in order. [`FunctionRegistry`] and [`ProcessMonitor`]
//! share the same bridge and survive stop/restart cycles.

pub mod config;
pub mod error;
pub mod events;
pub mod functions;
pub mod instance;
mod lifecycle;
pub mod monitor;
pub mod stages;

pub use config::{OrchestratorConfig, SandboxOptions};
pub use error::{OrchestratorError, OrchestratorResult};
pub use events::{Event, EventBus};
pub use functions::{DeployedUnit, FunctionRegistry};
pub use instance::{ResourceSnapshot, SandboxInstance, SandboxState, Service, ServiceFlags};
pub use lifecycle::Orchestrator;
pub use monitor::{ProcessMonitor, ProcessRecord, ProcessStatus, SystemResources};
