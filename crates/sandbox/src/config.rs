use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_count: u32,
    pub memory_mb: u32,
    pub storage_mb: u32,
}

/// A host directory exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Everything a backend needs to boot one sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct BootSpec {
    pub id: uuid::Uuid,
    /// Disk image reference.
    pub image: PathBuf,
    pub mounts: Vec<Mount>,
    pub resources: ResourceLimits,
    /// Keep guest storage across boots.
    pub persistent: bool,
    pub network: bool,
}

impl BootSpec {
    pub fn validate(&self) -> Result<()> {
        if self.image.as_os_str().is_empty() {
            return Err(SandboxError::InvalidConfig("image path is empty".into()));
        }
        if self.resources.cpu_count == 0 {
            return Err(SandboxError::InvalidConfig("cpu_count must be at least 1".into()));
        }
        if self.resources.memory_mb == 0 {
            return Err(SandboxError::InvalidConfig("memory_mb must be at least 1".into()));
        }
        if let Some(m) = self.mounts.iter().find(|m| !m.target.starts_with('/')) {
            return Err(SandboxError::InvalidConfig(format!(
                "mount target must be absolute: {}",
                m.target
            )));
        }
        Ok(())
    }
}
