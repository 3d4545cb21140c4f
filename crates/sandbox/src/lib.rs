mod channel;
mod config;
mod error;
mod factory;
mod sandbox;

pub use channel::GuestChannel;
pub use config::{BootSpec, Mount, ResourceLimits};
pub use error::{Result, SandboxError};
pub use factory::SandboxFactory;
pub use sandbox::Sandbox;
