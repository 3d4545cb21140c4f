//! Request/response correlation over the sandbox message channel.
//!
//! The guest channel is a single duplex byte stream carrying newline-delimited
//! envelopes (see `bridge-proto`). Every outbound request gets a fresh id and
//! a pending slot; a background read loop resolves slots by id, in whatever
//! order the guest answers.
//!
//! ## Connection Flow
//!
//! 1. The sandbox backend boots and hands over the channel halves
//! 2. [`Bridge::attach`] spawns the read loop
//! 3. [`Bridge::handshake`] sends `ping`, waits for `pong`
//! 4. Requests flow until [`Bridge::detach`] or guest EOF, both of which
//!    reject every pending exchange with `ChannelClosed`

mod category;
mod direct;
mod error;

pub use category::{Category, Timeouts};
pub use direct::{DirectPath, HttpDirectPath};
pub use error::{BridgeError, Result, TransportError};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bridge_proto::{
    Decoder, Envelope, Invocation, InvocationResponse, ProxyRequest, ProxyResponse, Request,
    Response, ServiceKind,
};
use resilience::{Policy, Resilience};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Extra host-side wait on top of the guest-side command timeout.
const EXEC_GRACE: Duration = Duration::from_secs(5);

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Reply = oneshot::Sender<std::result::Result<Response, TransportError>>;

/// Result of running a console command in the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Host-side endpoint of the guest channel. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

struct Inner {
    resilience: Arc<Resilience>,
    timeouts: Timeouts,
    direct: Option<Arc<dyn DirectPath>>,
    next_id: AtomicU64,
    attached: AtomicBool,
    /// Bumped on every attach/detach so a stale read loop cannot tear down
    /// a newer link.
    generation: AtomicU64,
    pending: Mutex<HashMap<u64, Reply>>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Console turn. tokio's mutex is fair, so waiters are served FIFO.
    console: tokio::sync::Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Bridge {
    pub fn new(
        resilience: Arc<Resilience>,
        timeouts: Timeouts,
        direct: Option<Arc<dyn DirectPath>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resilience,
                timeouts,
                direct,
                next_id: AtomicU64::new(1),
                attached: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                writer: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                console: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn resilience(&self) -> &Arc<Resilience> {
        &self.inner.resilience
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.inner.timeouts
    }

    pub fn is_attached(&self) -> bool {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// Number of exchanges awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Take over a freshly booted guest channel, replacing any previous one.
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.detach().await;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.writer.lock().await = Some(Box::new(writer));
        self.inner.attached.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            Box::new(reader),
            generation,
        ));
        *lock(&self.inner.reader) = Some(handle);

        info!(generation, "bridge attached");
    }

    /// Drop the channel and reject every pending exchange.
    pub async fn detach(&self) {
        let was_attached = self.inner.attached.swap(false, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(handle) = lock(&self.inner.reader).take() {
            handle.abort();
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let rejected = self.inner.reject_pending();

        if was_attached {
            info!(rejected, "bridge detached");
        }
    }

    /// Confirm the guest is answering: `ping` → `pong`.
    pub async fn handshake(&self) -> Result<()> {
        let policy = self.policy(Category::Ping, "handshake");
        self.call(&policy, Request::Ping, |resp| match resp {
            Response::Pong => Ok(()),
            other => Err(unexpected("pong", &other)),
        })
        .await?;
        debug!("bridge handshake complete");
        Ok(())
    }

    /// Send an arbitrary request under `category`'s policy.
    pub async fn request(&self, category: Category, request: Request) -> Result<Response> {
        let policy = self.policy(category, request.name());
        self.call(&policy, request, Ok).await
    }

    /// Run a short shell command on the guest console.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        self.console(Category::Command, command, BTreeMap::new())
            .await
    }

    /// Run a long shell command (package installs) on the guest console.
    pub async fn install(&self, command: &str) -> Result<ExecOutput> {
        self.console(Category::Install, command, BTreeMap::new())
            .await
    }

    /// Run a console command with extra environment variables.
    ///
    /// Console commands are serialized: each waits for the previous one to
    /// settle before it is sent. A non-zero exit code is returned as data.
    pub async fn console(
        &self,
        category: Category,
        command: &str,
        env: BTreeMap<String, String>,
    ) -> Result<ExecOutput> {
        let timeout = self.inner.timeouts.get(category);
        let mut policy = self.policy(category, "exec");
        policy.timeout = timeout + EXEC_GRACE;
        let request = Request::Exec {
            command: command.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            env,
        };

        let _turn = self.inner.console.lock().await;
        debug!(command, "console command");
        self.call(&policy, request, |resp| match resp {
            Response::ExecResult {
                exit_code,
                stdout,
                stderr,
            } => Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            }),
            other => Err(unexpected("exec_result", &other)),
        })
        .await
    }

    /// Bring up a dependent service and wait for its readiness reply.
    /// Returns the port the service listens on, if it reported one.
    pub async fn start_service(&self, service: ServiceKind, config: Value) -> Result<Option<u16>> {
        let policy = self.policy(Category::Service, "service_start").target(service.as_str());
        self.call(&policy, Request::ServiceStart { service, config }, move |resp| {
            match resp {
                Response::ServiceReady { service: s, port } if s == service => Ok(port),
                other => Err(unexpected("service_ready", &other)),
            }
        })
        .await
    }

    pub async fn stop_service(&self, service: ServiceKind) -> Result<()> {
        let policy = self.policy(Category::Service, "service_stop").target(service.as_str());
        self.call(&policy, Request::ServiceStop { service }, |resp| match resp {
            Response::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        })
        .await
    }

    /// Run one deployed function in the guest runtime.
    ///
    /// A guest-side `error` reply surfaces as [`TransportError::Remote`].
    pub async fn invoke(&self, invocation: Invocation) -> Result<InvocationResponse> {
        let policy = self
            .policy(Category::Invoke, "invoke")
            .target(invocation.function.clone());
        self.call(&policy, Request::Invoke(invocation), |resp| match resp {
            Response::InvokeResult(result) => Ok(result),
            other => Err(unexpected("invoke_result", &other)),
        })
        .await
    }

    /// Forward an HTTP-style request through the guest routing proxy.
    ///
    /// Falls back to the direct path while the channel is not attached.
    /// Status 4xx/5xx surfaces as [`TransportError::Status`] so 5xx and 429
    /// are retried and 4xx is not.
    pub async fn proxy(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let policy = self
            .policy(Category::Proxy, "proxy")
            .target(request.path.clone());
        self.call(&policy, Request::Proxy(request), |resp| match resp {
            Response::ProxyResponse(r) if r.status >= 400 => Err(TransportError::Status {
                status: r.status,
                body: r.body,
            }),
            Response::ProxyResponse(r) => Ok(r),
            other => Err(unexpected("proxy_response", &other)),
        })
        .await
    }

    /// Ask the guest to shut down. Returns `true` if it acknowledged in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let result = tokio::time::timeout(timeout, self.exchange(&Request::Shutdown)).await;
        matches!(result, Ok(Ok(Response::ShutdownAck)))
    }

    fn policy(&self, category: Category, operation: &str) -> Policy {
        self.inner.timeouts.policy(category, operation)
    }

    async fn call<T, F>(&self, policy: &Policy, request: Request, expect: F) -> Result<T>
    where
        F: Fn(Response) -> std::result::Result<T, TransportError>,
    {
        let this = self;
        let request = &request;
        let expect = &expect;
        self.inner
            .resilience
            .execute(policy, move || async move {
                expect(this.exchange(request).await?)
            })
            .await
    }

    /// One request/response round trip, no policy applied.
    async fn exchange(&self, request: &Request) -> std::result::Result<Response, TransportError> {
        if !self.is_attached() {
            if let (Request::Proxy(req), Some(direct)) = (request, &self.inner.direct) {
                debug!(path = %req.path, "channel not attached, using direct path");
                return direct.forward(req).await.map(Response::ProxyResponse);
            }
            return Err(TransportError::NotReady);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);
        let _slot = PendingSlot {
            inner: &self.inner,
            id,
        };

        let line = bridge_proto::encode_request(id, request)?;
        {
            let mut writer = self.inner.writer.lock().await;
            let writer = writer.as_mut().ok_or(TransportError::NotReady)?;
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        debug!(id, kind = request.name(), "request sent");

        rx.await.map_err(|_| TransportError::ChannelClosed)?
    }
}

impl Inner {
    fn dispatch(&self, envelope: Envelope) {
        let Some(reply) = lock(&self.pending).remove(&envelope.id) else {
            debug!(id = envelope.id, kind = %envelope.kind, "discarding unmatched envelope");
            return;
        };
        let result = match &envelope.error {
            Some(message) => Err(TransportError::Remote {
                message: message.clone(),
            }),
            None => envelope.parse::<Response>().map_err(TransportError::from),
        };
        // Receiver gone means the caller timed out in the meantime.
        let _ = reply.send(result);
    }

    fn reject_pending(&self) -> usize {
        let drained: Vec<Reply> = lock(&self.pending).drain().map(|(_, r)| r).collect();
        let n = drained.len();
        for reply in drained {
            let _ = reply.send(Err(TransportError::ChannelClosed));
        }
        n
    }

    async fn closed(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.attached.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
        let rejected = self.reject_pending();
        warn!(rejected, "bridge channel closed by guest");
    }
}

/// Removes the pending entry when the exchange settles or is cancelled.
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
    }
}

fn unexpected(expected: &'static str, got: &Response) -> TransportError {
    TransportError::Unexpected {
        expected,
        got: got.name(),
    }
}

async fn read_loop(inner: Weak<Inner>, mut reader: BoxReader, generation: u64) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "bridge read failed");
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        // n <= buf.len() is guaranteed by read()
        for item in decoder.decode(buf.get(..n).unwrap_or_default()) {
            match item {
                Ok(envelope) => inner.dispatch(envelope),
                Err(e) => warn!(error = %e, "discarding malformed envelope"),
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.closed(generation).await;
    }
}
