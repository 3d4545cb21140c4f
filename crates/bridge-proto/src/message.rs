use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dependent services the guest can bring up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// SQL API gateway bound to the embedded database bridge.
    Gateway,
    FunctionRuntime,
    /// Request-routing proxy.
    Proxy,
    /// Optional network overlay.
    Overlay,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::FunctionRuntime => "function_runtime",
            Self::Proxy => "proxy",
            Self::Overlay => "overlay",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-to-guest messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Exec {
        command: String,
        timeout_ms: u64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    ServiceStart {
        service: ServiceKind,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        config: Value,
    },
    ServiceStop {
        service: ServiceKind,
    },
    Invoke(Invocation),
    Proxy(ProxyRequest),
    Shutdown,
}

impl Request {
    /// Wire name of this message type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Exec { .. } => "exec",
            Self::ServiceStart { .. } => "service_start",
            Self::ServiceStop { .. } => "service_stop",
            Self::Invoke(_) => "invoke",
            Self::Proxy(_) => "proxy",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Guest-to-host messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Response {
    Pong,
    ExecResult {
        exit_code: i32,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
    ServiceReady {
        service: ServiceKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Ack,
    InvokeResult(InvocationResponse),
    ProxyResponse(ProxyResponse),
    ShutdownAck,
}

impl Response {
    /// Wire name of this message type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pong => "pong",
            Self::ExecResult { .. } => "exec_result",
            Self::ServiceReady { .. } => "service_ready",
            Self::Ack => "ack",
            Self::InvokeResult(_) => "invoke_result",
            Self::ProxyResponse(_) => "proxy_response",
            Self::ShutdownAck => "shutdown_ack",
        }
    }
}

/// Caller-supplied part of a function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

fn default_method() -> String {
    "POST".to_string()
}

impl Default for InvocationRequest {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: BTreeMap::new(),
            body: Value::Null,
        }
    }
}

impl InvocationRequest {
    pub fn with_body(body: Value) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }
}

/// Environment handed to user code alongside the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub project: String,
}

/// Everything the function runtime needs to run one deployed unit once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub function: String,
    pub version: u32,
    pub code: String,
    pub request: InvocationRequest,
    pub context: ExecutionContext,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationMetrics {
    pub duration_ms: u64,
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub metrics: InvocationMetrics,
}

impl InvocationResponse {
    /// Plain JSON response with the given status.
    pub fn json(status: u16, body: Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            status,
            headers,
            body,
            logs: Vec::new(),
            metrics: InvocationMetrics::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}
