use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bridge::{Bridge, BridgeError};
use bridge_proto::{ExecutionContext, Invocation, InvocationRequest, InvocationResponse};
use chrono::{DateTime, Utc};
use resilience::{Classify, ErrorKind};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::FunctionsConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventBus};

const MAX_NAME_LEN: usize = 64;

/// Markers that identify a handler the function runtime can call.
const ENTRY_POINTS: &[&str] = &[
    "export default",
    "Deno.serve(",
    "serve(",
    "addEventListener(\"fetch\"",
    "addEventListener('fetch'",
    "module.exports",
    "exports.handler",
];

/// A named, versioned piece of user code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedUnit {
    pub name: String,
    #[serde(skip_serializing)]
    pub code: String,
    pub version: u32,
    pub deployed_at: DateTime<Utc>,
    /// Hex sha-256 of `code`.
    pub checksum: String,
}

/// Deployed functions, keyed by name. Clone is a cheap Arc refcount bump and
/// clones share the same table.
#[derive(Clone)]
pub struct FunctionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    bridge: Bridge,
    events: EventBus,
    config: FunctionsConfig,
    table: Mutex<Table>,
}

#[derive(Default)]
struct Table {
    units: HashMap<String, DeployedUnit>,
    /// Highest version ever issued per name, kept after removal so versions
    /// are never reused.
    versions: HashMap<String, u32>,
}

impl FunctionRegistry {
    pub fn new(bridge: Bridge, events: EventBus, config: FunctionsConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridge,
                events,
                config,
                table: Mutex::new(Table::default()),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and store `code` under `name`, replacing any previous version.
    pub fn deploy(&self, name: &str, code: &str) -> OrchestratorResult<DeployedUnit> {
        validate_name(name)?;
        self.validate_code(code)?;

        let unit = {
            let mut table = self.table();
            let version = table.versions.get(name).copied().unwrap_or(0) + 1;
            let unit = DeployedUnit {
                name: name.to_string(),
                code: code.to_string(),
                version,
                deployed_at: Utc::now(),
                checksum: format!("{:x}", Sha256::digest(code.as_bytes())),
            };
            table.versions.insert(name.to_string(), version);
            table.units.insert(name.to_string(), unit.clone());
            unit
        };

        info!(name, version = unit.version, checksum = %unit.checksum, "function deployed");
        self.inner.events.emit(Event::FunctionDeployed {
            name: unit.name.clone(),
            version: unit.version,
        });
        Ok(unit)
    }

    pub fn remove(&self, name: &str) -> OrchestratorResult<()> {
        if self.table().units.remove(name).is_none() {
            return Err(OrchestratorError::FunctionNotFound(name.to_string()));
        }
        info!(name, "function removed");
        self.inner.events.emit(Event::FunctionRemoved {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<DeployedUnit> {
        self.table().units.get(name).cloned()
    }

    /// All deployed units, sorted by name.
    pub fn list(&self) -> Vec<DeployedUnit> {
        let mut units: Vec<_> = self.table().units.values().cloned().collect();
        units.sort_by(|a, b| a.name.cmp(&b.name));
        units
    }

    pub fn len(&self) -> usize {
        self.table().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a deployed function in the guest runtime.
    ///
    /// Unknown names yield a 404 response and failures inside user code a
    /// 500 response with the guest's message in `logs`. Only transport-level
    /// failures (timeout, channel down, breaker or limiter refusal) are `Err`.
    pub async fn invoke(
        &self,
        name: &str,
        request: InvocationRequest,
        user: Option<String>,
    ) -> Result<InvocationResponse, BridgeError> {
        let Some(unit) = self.get(name) else {
            return Ok(InvocationResponse::json(
                404,
                json!({ "error": format!("function '{name}' not found") }),
            ));
        };

        let invocation = Invocation {
            function: unit.name,
            version: unit.version,
            code: unit.code,
            request,
            context: ExecutionContext {
                env: self.inner.config.env.clone(),
                user,
                project: self.inner.config.project.clone(),
            },
        };

        match self.inner.bridge.invoke(invocation).await {
            Ok(response) => Ok(response),
            Err(e) if e.kind() == ErrorKind::Execution => {
                let message = e
                    .source_error()
                    .map_or_else(|| e.to_string(), ToString::to_string);
                warn!(name, error = %message, "function failed");
                let mut response = InvocationResponse::json(
                    500,
                    json!({ "error": "function execution failed" }),
                );
                response.logs = vec![message];
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    fn validate_code(&self, code: &str) -> OrchestratorResult<()> {
        if code.trim().is_empty() {
            return Err(OrchestratorError::InvalidFunction("code is empty".into()));
        }
        let limit = self.inner.config.max_code_bytes;
        if code.len() > limit {
            return Err(OrchestratorError::InvalidFunction(format!(
                "code is {} bytes, limit is {limit}",
                code.len()
            )));
        }
        if !ENTRY_POINTS.iter().any(|marker| code.contains(marker)) {
            return Err(OrchestratorError::InvalidFunction(
                "no entry point found (expected `export default`, `Deno.serve(` or similar)"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> OrchestratorResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let valid_rest =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid_start || !valid_rest || name.len() > MAX_NAME_LEN {
        return Err(OrchestratorError::InvalidFunction(format!(
            "invalid name '{name}': use up to {MAX_NAME_LEN} lowercase letters, digits, '-' or '_'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use bridge::Timeouts;
    use guest_sim::GuestSim;
    use resilience::{Resilience, ResilienceConfig};
    use tokio::io::{duplex, split};

    use super::*;

    const ECHO: &str = "export default (req) => new Response(JSON.stringify(req.body));";

    fn bridge() -> Bridge {
        Bridge::new(
            Arc::new(Resilience::new(ResilienceConfig::default())),
            Timeouts::default(),
            None,
        )
    }

    async fn attached(sim: &GuestSim) -> Bridge {
        let bridge = bridge();
        let (host, guest) = duplex(64 * 1024);
        let (guest_r, guest_w) = split(guest);
        let sim = sim.clone();
        tokio::spawn(async move { sim.serve(guest_r, guest_w).await });
        let (host_r, host_w) = split(host);
        bridge.attach(host_r, host_w).await;
        bridge
    }

    fn registry(bridge: Bridge) -> (FunctionRegistry, EventBus) {
        let events = EventBus::default();
        let config = FunctionsConfig {
            project: "acme".into(),
            max_code_bytes: 256,
            ..FunctionsConfig::default()
        };
        (FunctionRegistry::new(bridge, events.clone(), config), events)
    }

    #[tokio::test]
    async fn redeploy_increments_version() {
        let (registry, events) = registry(bridge());
        let mut rx = events.subscribe();

        let first = registry.deploy("echo", ECHO).unwrap();
        assert_eq!(first.version, 1);
        let second = registry.deploy("echo", &format!("{ECHO}\n// v2")).unwrap();
        assert_eq!(second.version, 2);
        assert_ne!(first.checksum, second.checksum);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().version, 2);

        assert_eq!(
            rx.recv().await.unwrap(),
            Event::FunctionDeployed {
                name: "echo".into(),
                version: 1
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::FunctionDeployed {
                name: "echo".into(),
                version: 2
            }
        );
    }

    #[test]
    fn versions_are_not_reused_after_removal() {
        let (registry, _events) = registry(bridge());
        registry.deploy("echo", ECHO).unwrap();
        registry.remove("echo").unwrap();
        assert!(registry.get("echo").is_none());
        assert_eq!(registry.deploy("echo", ECHO).unwrap().version, 2);
    }

    #[test]
    fn checksum_is_sha256_hex() {
        let (registry, _events) = registry(bridge());
        let unit = registry.deploy("echo", ECHO).unwrap();
        assert_eq!(unit.checksum.len(), 64);
        assert!(unit.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rejects_invalid_code_and_names() {
        let (registry, _events) = registry(bridge());
        let err = registry.deploy("echo", "console.log('hi')").unwrap_err();
        assert!(err.to_string().contains("entry point"), "{err}");
        assert!(registry.deploy("echo", "   ").is_err());
        assert!(registry.deploy("echo", &"x".repeat(300)).is_err());
        assert!(registry.deploy("Echo", ECHO).is_err());
        assert!(registry.deploy("-echo", ECHO).is_err());
        assert!(registry.deploy("", ECHO).is_err());
        assert!(registry.deploy("ok_name-2", ECHO).is_ok());
    }

    #[test]
    fn remove_unknown_is_not_found() {
        let (registry, _events) = registry(bridge());
        let err = registry.remove("ghost").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn list_is_sorted() {
        let (registry, _events) = registry(bridge());
        registry.deploy("zeta", ECHO).unwrap();
        registry.deploy("alpha", ECHO).unwrap();
        let names: Vec<_> = registry.list().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn unknown_function_is_404_response() {
        // Not attached: the bridge is never consulted.
        let (registry, _events) = registry(bridge());
        let resp = registry
            .invoke("ghost", InvocationRequest::default(), None)
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
    }

    #[tokio::test]
    async fn invoke_passes_context() {
        let sim = GuestSim::new();
        let (registry, _events) = registry(attached(&sim).await);
        registry.deploy("echo", ECHO).unwrap();

        let resp = registry
            .invoke(
                "echo",
                InvocationRequest::with_body(json!({"name": "X"})),
                Some("user-1".into()),
            )
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["echo"]["name"], "X");
        assert_eq!(resp.body["project"], "acme");
        assert_eq!(resp.body["version"], 1);
        assert_eq!(sim.invoked(), vec!["echo"]);
    }

    #[tokio::test]
    async fn user_code_failure_is_500_response() {
        let sim = GuestSim::new();
        let (registry, _events) = registry(attached(&sim).await);
        registry
            .deploy("boom", "export default () => { throw new Error('kaput') }")
            .unwrap();

        let resp = registry
            .invoke("boom", InvocationRequest::default(), None)
            .await
            .unwrap();
        assert_eq!(resp.status, 500);
        assert!(resp.logs.iter().any(|l| l.contains("kaput")), "{:?}", resp.logs);
    }

    #[tokio::test]
    async fn channel_down_is_an_error() {
        let (registry, _events) = registry(bridge());
        registry.deploy("echo", ECHO).unwrap();
        let err = registry
            .invoke("echo", InvocationRequest::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Initialization);
    }
}
