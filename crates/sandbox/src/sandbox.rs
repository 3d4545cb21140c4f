use async_trait::async_trait;

use crate::channel::GuestChannel;
use crate::error::Result;

/// One bootable sandbox instance.
#[async_trait]
pub trait Sandbox: Send + Sync {
    // -- identity --
    fn id(&self) -> &str;

    // -- lifecycle --
    /// Boot the sandbox and return the guest message channel once it is up.
    async fn start(&mut self) -> Result<GuestChannel>;
    /// Graceful shutdown.
    async fn stop(&mut self) -> Result<()>;
    async fn kill(&mut self) -> Result<()>;
}
