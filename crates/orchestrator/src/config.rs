use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bridge::Timeouts;
use resilience::ResilienceConfig;
use sandbox::{Mount, ResourceLimits};
use sandbox_process::ProcessConfig;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{OrchestratorError, OrchestratorResult};

pub(crate) const DEFAULT_CPU_COUNT: u32 = 2;
pub(crate) const DEFAULT_MEMORY_MB: u32 = 2048;
pub(crate) const DEFAULT_STORAGE_MB: u32 = 4096;
pub(crate) const DEFAULT_MONITOR_INTERVAL_MS: u64 = 5_000;
pub(crate) const DEFAULT_MIN_PID: u32 = 100;
pub(crate) const DEFAULT_MAX_CODE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub sandbox: SandboxConfig,
    /// Network overlay credentials. Stage 6 only runs when present.
    pub overlay: Option<OverlayConfig>,
    pub runtime: RuntimeConfig,
    pub resilience: ResilienceConfig,
    pub timeouts: Timeouts,
    pub monitor: MonitorConfig,
    pub functions: FunctionsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Disk image the sandbox boots from.
    pub image: PathBuf,
    pub mounts: Vec<Mount>,
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub storage_mb: u32,
    pub persistent: bool,
    pub network: bool,
    /// Host program used by the process backend.
    pub process: Option<ProcessConfig>,
    /// Host-reachable base URL for proxy calls made before the channel is up.
    pub direct_url: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: PathBuf::new(),
            mounts: Vec::new(),
            memory_mb: DEFAULT_MEMORY_MB,
            cpu_count: DEFAULT_CPU_COUNT,
            storage_mb: DEFAULT_STORAGE_MB,
            persistent: false,
            network: true,
            process: None,
            direct_url: None,
        }
    }
}

impl SandboxConfig {
    pub fn resources(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_count: self.cpu_count,
            memory_mb: self.memory_mb,
            storage_mb: self.storage_mb,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub auth_key: String,
    pub hostname: String,
}

/// Commands that confirm and, if missing, install the guest language runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub check_command: String,
    pub install_command: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            check_command: "deno --version".into(),
            install_command: "curl -fsSL https://deno.land/install.sh | sh".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Poll interval used by the CLI; 0 disables background monitoring.
    pub interval_ms: u64,
    /// Processes below this PID are treated as system processes and hidden.
    pub min_pid: u32,
    /// Guest directory holding per-process `<pid>.log` files.
    pub log_dir: String,
    /// Seconds between SIGTERM and SIGKILL in `kill_process`.
    pub kill_grace_secs: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
            min_pid: DEFAULT_MIN_PID,
            log_dir: "/var/log/sandbox".into(),
            kill_grace_secs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    /// Project identity handed to every invocation.
    pub project: String,
    /// Environment handed to every invocation.
    pub env: BTreeMap<String, String>,
    pub max_code_bytes: usize,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            project: "default".into(),
            env: BTreeMap::new(),
            max_code_bytes: DEFAULT_MAX_CODE_BYTES,
        }
    }
}

/// Runtime overrides applied on the next `start()`. `None` keeps the current
/// value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxOptions {
    pub memory_mb: Option<u32>,
    pub cpu_count: Option<u32>,
    pub storage_mb: Option<u32>,
    pub persistent: Option<bool>,
    pub network: Option<bool>,
    pub overlay: Option<OverlayConfig>,
}

impl SandboxOptions {
    pub(crate) fn validate(&self) -> OrchestratorResult<()> {
        for (label, value) in [
            ("memory_mb", self.memory_mb),
            ("cpu_count", self.cpu_count),
            ("storage_mb", self.storage_mb),
        ] {
            if value == Some(0) {
                return Err(OrchestratorError::Config(format!(
                    "{label} must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate an orchestrator config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> OrchestratorResult<OrchestratorConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| OrchestratorError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: OrchestratorConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| OrchestratorError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl OrchestratorConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() && !p.as_os_str().is_empty() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.sandbox.image);
        for mount in &mut self.sandbox.mounts {
            resolve(&mut mount.source);
        }
        if let Some(process) = &mut self.sandbox.process {
            // A bare program name is looked up on PATH, not next to the config.
            if process.program.components().count() > 1 {
                resolve(&mut process.program);
            }
            if let Some(dir) = &mut process.working_dir {
                resolve(dir);
            }
        }
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.sandbox.image.as_os_str().is_empty() {
            return Err(OrchestratorError::Config("sandbox.image is required".into()));
        }
        SandboxOptions {
            memory_mb: Some(self.sandbox.memory_mb),
            cpu_count: Some(self.sandbox.cpu_count),
            storage_mb: Some(self.sandbox.storage_mb),
            ..SandboxOptions::default()
        }
        .validate()?;
        self.direct_url()?;
        if self.resilience.max_concurrent == 0 {
            return Err(OrchestratorError::Config(
                "resilience.max_concurrent must be at least 1".into(),
            ));
        }
        if self.resilience.retry.max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "resilience.retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.functions.project.is_empty() {
            return Err(OrchestratorError::Config("functions.project is required".into()));
        }
        Ok(())
    }

    pub fn direct_url(&self) -> OrchestratorResult<Option<Url>> {
        self.sandbox
            .direct_url
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    OrchestratorError::Config(format!("sandbox.direct_url {raw}: {e}"))
                })
            })
            .transpose()
    }
}
