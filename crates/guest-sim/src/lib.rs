//! Scriptable in-process guest for exercising the host side without a VM.
//!
//! [`GuestSim`] speaks the envelope protocol over any byte stream. Replies are
//! scripted per message type; anything unscripted gets a benign default:
//!
//! - `ping` → `pong`
//! - `exec` → first matching prefix script, else exit 0 with empty output
//! - `service_start` → per-service script, else ready on the default port
//! - `invoke` → a tiny runtime that echoes the request body back, or fails
//!   when the code contains `throw`
//! - `proxy` → 200 with the request path as body
//! - `shutdown` → `shutdown_ack`, then the connection ends
//!
//! [`SimFactory`] wraps it as a [`sandbox::SandboxFactory`] so the whole boot
//! path runs in-process.

mod factory;

pub use factory::{SimFactory, SimSandbox};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bridge_proto::{
    Envelope, Invocation, InvocationMetrics, InvocationResponse, ProxyRequest, ProxyResponse,
    Request, Response, ServiceKind,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Maximum length for command preview in logs.
const COMMAND_PREVIEW_MAX_LEN: usize = 100;

/// Scripted reply to a console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReply {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecReply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Scripted reply to `service_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    Ready(Option<u16>),
    Fail(String),
    /// Never answer.
    Silent,
}

#[derive(Default)]
struct Script {
    exec: Vec<(String, ExecReply)>,
    services: HashMap<ServiceKind, ServiceReply>,
    silent: bool,
    exec_delay: Option<Duration>,
    executed: Vec<String>,
    started: Vec<ServiceKind>,
    invoked: Vec<String>,
}

/// Scriptable guest. Clones share the same script and history.
#[derive(Clone, Default)]
pub struct GuestSim {
    script: Arc<Mutex<Script>>,
}

impl GuestSim {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply to commands starting with `prefix`. Later scripts win.
    pub fn on_exec(&self, prefix: impl Into<String>, reply: ExecReply) -> &Self {
        self.script().exec.insert(0, (prefix.into(), reply));
        self
    }

    pub fn on_service(&self, service: ServiceKind, reply: ServiceReply) -> &Self {
        self.script().services.insert(service, reply);
        self
    }

    /// Delay every console reply, to keep commands in flight.
    pub fn exec_delay(&self, delay: Duration) -> &Self {
        self.script().exec_delay = Some(delay);
        self
    }

    /// Stop answering anything, including `ping`.
    pub fn set_silent(&self, silent: bool) -> &Self {
        self.script().silent = silent;
        self
    }

    /// Console commands received so far, in arrival order.
    pub fn executed(&self) -> Vec<String> {
        self.script().executed.clone()
    }

    /// Services started so far, in arrival order.
    pub fn started(&self) -> Vec<ServiceKind> {
        self.script().started.clone()
    }

    /// Functions invoked so far, in arrival order.
    pub fn invoked(&self) -> Vec<String> {
        self.script().invoked.clone()
    }

    /// Serve one connection until EOF, `shutdown`, or an I/O error.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let envelope: Envelope = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "guest: malformed envelope");
                    continue;
                }
            };
            let reply = match envelope.parse::<Request>() {
                Ok(request) => {
                    debug!(id = envelope.id, kind = request.name(), "guest: received");
                    let shutdown = matches!(request, Request::Shutdown);
                    let reply = self.handle(envelope.id, request).await;
                    if let Some(reply) = reply {
                        write(&mut writer, &reply).await?;
                    }
                    if shutdown {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => Envelope::error(envelope.id, e.to_string()),
            };
            write(&mut writer, &reply).await?;
        }
        Ok(())
    }

    async fn handle(&self, id: u64, request: Request) -> Option<Envelope> {
        if self.script().silent {
            return None;
        }
        let response = match request {
            Request::Ping => Response::Pong,
            Request::Exec { command, .. } => {
                let (reply, delay) = {
                    let mut script = self.script();
                    script.executed.push(command.clone());
                    let reply = script
                        .exec
                        .iter()
                        .find(|(prefix, _)| command.starts_with(prefix.as_str()))
                        .map(|(_, r)| r.clone())
                        .unwrap_or_else(|| ExecReply::ok(""));
                    (reply, script.exec_delay)
                };
                debug!(command = %truncate_preview(&command), "guest: exec");
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Response::ExecResult {
                    exit_code: reply.exit_code,
                    stdout: reply.stdout,
                    stderr: reply.stderr,
                }
            }
            Request::ServiceStart { service, .. } => {
                let reply = {
                    let mut script = self.script();
                    script.started.push(service);
                    script
                        .services
                        .get(&service)
                        .cloned()
                        .unwrap_or(ServiceReply::Ready(default_port(service)))
                };
                match reply {
                    ServiceReply::Ready(port) => Response::ServiceReady { service, port },
                    ServiceReply::Fail(message) => return Some(Envelope::error(id, message)),
                    ServiceReply::Silent => return None,
                }
            }
            Request::ServiceStop { .. } => Response::Ack,
            Request::Invoke(invocation) => {
                self.script().invoked.push(invocation.function.clone());
                match run_function(&invocation) {
                    Ok(resp) => Response::InvokeResult(resp),
                    Err(message) => return Some(Envelope::error(id, message)),
                }
            }
            Request::Proxy(req) => Response::ProxyResponse(route(&req)),
            Request::Shutdown => Response::ShutdownAck,
        };
        match Envelope::new(id, &response) {
            Ok(env) => Some(env),
            Err(e) => Some(Envelope::error(id, e.to_string())),
        }
    }
}

async fn write<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> io::Result<()> {
    let line = envelope
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    writer.write_all(&line).await?;
    writer.flush().await
}

fn default_port(service: ServiceKind) -> Option<u16> {
    match service {
        ServiceKind::Gateway => Some(54321),
        ServiceKind::FunctionRuntime => Some(9000),
        ServiceKind::Proxy => Some(8000),
        ServiceKind::Overlay => None,
    }
}

/// The simulated function runtime.
fn run_function(invocation: &Invocation) -> Result<InvocationResponse, String> {
    if let Some(pos) = invocation.code.find("throw") {
        let message = invocation
            .code
            .get(pos..)
            .and_then(|rest| rest.split('\'').nth(1))
            .unwrap_or("function threw");
        return Err(format!("Uncaught Error: {message}"));
    }
    let body = json!({
        "function": invocation.function,
        "version": invocation.version,
        "project": invocation.context.project,
        "echo": invocation.request.body,
    });
    let mut resp = InvocationResponse::json(200, body);
    resp.logs = vec![format!(
        "{} v{} handled {}",
        invocation.function, invocation.version, invocation.request.method
    )];
    resp.metrics = InvocationMetrics {
        duration_ms: 3,
        memory_mb: 12.5,
        cpu_percent: 1.0,
    };
    Ok(resp)
}

fn route(req: &ProxyRequest) -> ProxyResponse {
    let mut headers = BTreeMap::new();
    headers.insert("x-routed-by".to_string(), "guest-sim".to_string());
    ProxyResponse {
        status: 200,
        headers,
        body: req.path.clone(),
    }
}

/// Truncate a command string for logging, preserving UTF-8 boundaries.
fn truncate_preview(s: &str) -> String {
    if s.len() <= COMMAND_PREVIEW_MAX_LEN {
        return s.to_string();
    }
    let end = s
        .char_indices()
        .take_while(|(i, _)| *i < COMMAND_PREVIEW_MAX_LEN)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(COMMAND_PREVIEW_MAX_LEN);
    format!("{}...", s.get(..end).unwrap_or(s))
}
