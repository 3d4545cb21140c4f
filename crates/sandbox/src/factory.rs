use async_trait::async_trait;

use crate::config::BootSpec;
use crate::error::Result;
use crate::sandbox::Sandbox;

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "process").
    fn name(&self) -> &str;
    /// Create a sandbox for `spec`. Nothing runs until [`Sandbox::start`].
    async fn create(&self, spec: BootSpec) -> Result<Box<dyn Sandbox>>;
}
