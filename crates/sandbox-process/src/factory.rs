use async_trait::async_trait;
use sandbox::{BootSpec, Sandbox, SandboxError, SandboxFactory};
use tracing::info;

use crate::config::ProcessConfig;
use crate::sandbox::ProcessSandbox;

pub struct ProcessFactory {
    config: ProcessConfig,
}

impl ProcessFactory {
    /// Resolve the program up front so a missing binary fails at setup, not
    /// on first boot.
    pub fn new(mut config: ProcessConfig) -> Result<Self, SandboxError> {
        let resolved = which::which(&config.program).map_err(|e| {
            SandboxError::BackendNotAvailable(format!("{}: {e}", config.program.display()))
        })?;
        info!(program = %resolved.display(), "process backend ready");
        config.program = resolved;
        Ok(Self { config })
    }
}

#[async_trait]
impl SandboxFactory for ProcessFactory {
    fn name(&self) -> &str {
        "process"
    }

    async fn create(&self, spec: BootSpec) -> sandbox::Result<Box<dyn Sandbox>> {
        spec.validate()?;
        if let Some(dir) = &self.config.working_dir
            && !dir.is_dir()
        {
            return Err(SandboxError::CreationFailed(format!(
                "working directory does not exist: {}",
                dir.display()
            )));
        }
        Ok(Box::new(ProcessSandbox::new(self.config.clone(), spec)))
    }
}
