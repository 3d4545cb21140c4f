//! Bring-up stages run after the sandbox boots.
//!
//! | # | Stage | Mandatory | Readiness signal |
//! |---|-------|-----------|------------------|
//! | 1 | boot | yes | guest answers `ping` |
//! | 2 | runtime | yes | check (or install) command exits 0 |
//! | 3 | gateway | no | `service_ready` |
//! | 4 | functions | no, needs 3 | `service_ready` |
//! | 5 | proxy | no, needs 4 | `service_ready` |
//! | 6 | overlay | no, needs overlay config | `service_ready` |

use bridge::Bridge;
use bridge_proto::ServiceKind;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::{FunctionsConfig, OverlayConfig, RuntimeConfig};
use crate::instance::Service;

pub(crate) const GATEWAY_PORT: u16 = 54321;
pub(crate) const AUTH_PORT: u16 = 9999;
pub(crate) const STORAGE_PORT: u16 = 5000;
pub(crate) const FUNCTIONS_PORT: u16 = 9000;

/// One proxy route: requests under `prefix` go to `port` inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub name: &'static str,
    pub prefix: &'static str,
    pub port: u16,
}

/// The fixed route table. The gateway and function runtime ports come from
/// their readiness replies when they report one.
pub fn route_table(gateway_port: Option<u16>, functions_port: Option<u16>) -> Vec<Route> {
    vec![
        Route {
            name: "rest",
            prefix: "/rest/v1",
            port: gateway_port.unwrap_or(GATEWAY_PORT),
        },
        Route {
            name: "auth",
            prefix: "/auth/v1",
            port: AUTH_PORT,
        },
        Route {
            name: "storage",
            prefix: "/storage/v1",
            port: STORAGE_PORT,
        },
        Route {
            name: "functions",
            prefix: "/functions/v1",
            port: functions_port.unwrap_or(FUNCTIONS_PORT),
        },
    ]
}

pub(crate) fn service_kind(service: Service) -> Option<ServiceKind> {
    match service {
        Service::Runtime => None,
        Service::Gateway => Some(ServiceKind::Gateway),
        Service::Functions => Some(ServiceKind::FunctionRuntime),
        Service::Proxy => Some(ServiceKind::Proxy),
        Service::Overlay => Some(ServiceKind::Overlay),
    }
}

pub(crate) fn gateway_config() -> Value {
    json!({ "database": "embedded", "port": GATEWAY_PORT })
}

pub(crate) fn functions_config(functions: &FunctionsConfig) -> Value {
    json!({
        "project": functions.project,
        "env": functions.env,
        "port": FUNCTIONS_PORT,
    })
}

pub(crate) fn proxy_config(routes: &[Route]) -> Value {
    json!({ "routes": routes })
}

pub(crate) fn overlay_config(overlay: &OverlayConfig) -> Value {
    json!({ "auth_key": overlay.auth_key, "hostname": overlay.hostname })
}

/// Stage 2: confirm the language runtime, installing it when the check fails.
pub(crate) async fn ensure_runtime(bridge: &Bridge, runtime: &RuntimeConfig) -> Result<(), String> {
    let check = bridge
        .exec(&runtime.check_command)
        .await
        .map_err(|e| format!("runtime check: {e}"))?;
    if check.success() {
        info!(version = %check.stdout.trim(), "runtime available");
        return Ok(());
    }

    warn!(exit_code = check.exit_code, "runtime missing, installing");
    let install = bridge
        .install(&runtime.install_command)
        .await
        .map_err(|e| format!("runtime install: {e}"))?;
    if !install.success() {
        return Err(format!(
            "runtime install exited with {}: {}",
            install.exit_code,
            install.stderr.trim()
        ));
    }

    let recheck = bridge
        .exec(&runtime.check_command)
        .await
        .map_err(|e| format!("runtime check: {e}"))?;
    if !recheck.success() {
        return Err(format!(
            "runtime still unavailable after install (exit {})",
            recheck.exit_code
        ));
    }
    info!(version = %recheck.stdout.trim(), "runtime installed");
    Ok(())
}
