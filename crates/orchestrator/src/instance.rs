use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::monitor::SystemResources;

/// Lifecycle state of the managed sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl SandboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dependent services brought up after the sandbox boots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    /// Language runtime inside the guest.
    Runtime,
    /// SQL API gateway.
    Gateway,
    /// Function execution runtime.
    Functions,
    /// Request routing proxy.
    Proxy,
    /// Optional network overlay.
    Overlay,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Self::Runtime,
        Self::Gateway,
        Self::Functions,
        Self::Proxy,
        Self::Overlay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::Gateway => "gateway",
            Self::Functions => "functions",
            Self::Proxy => "proxy",
            Self::Overlay => "overlay",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Readiness flag per dependent service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceFlags {
    pub runtime: bool,
    pub gateway: bool,
    pub functions: bool,
    pub proxy: bool,
    pub overlay: bool,
}

impl ServiceFlags {
    pub fn get(&self, service: Service) -> bool {
        match service {
            Service::Runtime => self.runtime,
            Service::Gateway => self.gateway,
            Service::Functions => self.functions,
            Service::Proxy => self.proxy,
            Service::Overlay => self.overlay,
        }
    }

    /// Set one flag, returning whether it changed.
    pub fn set(&mut self, service: Service, ready: bool) -> bool {
        let flag = match service {
            Service::Runtime => &mut self.runtime,
            Service::Gateway => &mut self.gateway,
            Service::Functions => &mut self.functions,
            Service::Proxy => &mut self.proxy,
            Service::Overlay => &mut self.overlay,
        };
        let changed = *flag != ready;
        *flag = ready;
        changed
    }

    /// Services currently flagged ready.
    pub fn ready(&self) -> Vec<Service> {
        Service::ALL
            .into_iter()
            .filter(|s| self.get(*s))
            .collect()
    }
}

/// Configured limits plus the last measured usage, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub memory_mb: u32,
    pub cpu_count: u32,
    pub storage_mb: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<SystemResources>,
}

/// Status of the one sandbox an orchestrator manages.
///
/// Callers only ever see copies; the orchestrator owns the live value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInstance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<Uuid>,
    pub state: SandboxState,
    pub ready: bool,
    pub error: Option<String>,
    pub uptime_ms: u64,
    pub resources: ResourceSnapshot,
    pub services: ServiceFlags,
}

impl Default for SandboxInstance {
    fn default() -> Self {
        Self {
            sandbox_id: None,
            state: SandboxState::Stopped,
            ready: false,
            error: None,
            uptime_ms: 0,
            resources: ResourceSnapshot::default(),
            services: ServiceFlags::default(),
        }
    }
}
