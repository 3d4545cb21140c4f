use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bridge::{Bridge, Category, DirectPath, HttpDirectPath};
use resilience::Resilience;
use sandbox::{BootSpec, Sandbox, SandboxFactory};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{
    FunctionsConfig, OrchestratorConfig, OverlayConfig, RuntimeConfig, SandboxConfig,
    SandboxOptions,
};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{Event, EventBus};
use crate::functions::FunctionRegistry;
use crate::instance::{ResourceSnapshot, SandboxInstance, SandboxState, Service};
use crate::monitor::ProcessMonitor;
use crate::stages;

const UPTIME_TICK: Duration = Duration::from_secs(1);

/// Teardown order, reverse of bring-up.
const TEARDOWN: [Service; 4] = [
    Service::Overlay,
    Service::Proxy,
    Service::Functions,
    Service::Gateway,
];

/// Owns the one sandbox and sequences its bring-up and teardown.
///
/// Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn SandboxFactory>,
    bridge: Bridge,
    registry: FunctionRegistry,
    monitor: ProcessMonitor,
    events: EventBus,
    runtime: RuntimeConfig,
    functions: FunctionsConfig,
    /// Boot settings for the next `start()`.
    settings: Mutex<SandboxConfig>,
    overlay: Mutex<Option<OverlayConfig>>,
    status: Mutex<SandboxInstance>,
    /// Lifecycle turn. Held for the whole of a start or stop.
    sandbox: tokio::sync::Mutex<Option<Box<dyn Sandbox>>>,
    uptime: Mutex<Option<CancellationToken>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        factory: Arc<dyn SandboxFactory>,
    ) -> OrchestratorResult<Self> {
        let direct: Option<Arc<dyn DirectPath>> = match config.direct_url()? {
            Some(url) => {
                let path: Arc<dyn DirectPath> = Arc::new(
                    HttpDirectPath::new(url, config.timeouts.get(Category::Proxy))
                        .map_err(|e| OrchestratorError::Config(format!("direct path: {e}")))?,
                );
                Some(path)
            }
            None => None,
        };
        let resilience = Arc::new(Resilience::new(config.resilience.clone()));
        let bridge = Bridge::new(resilience, config.timeouts.clone(), direct);
        let events = EventBus::default();
        let registry =
            FunctionRegistry::new(bridge.clone(), events.clone(), config.functions.clone());
        let monitor = ProcessMonitor::new(bridge.clone(), config.monitor.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                bridge,
                registry,
                monitor,
                events,
                runtime: config.runtime,
                functions: config.functions,
                settings: Mutex::new(config.sandbox),
                overlay: Mutex::new(config.overlay),
                status: Mutex::new(SandboxInstance::default()),
                sandbox: tokio::sync::Mutex::new(None),
                uptime: Mutex::new(None),
            }),
        })
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    pub fn monitor(&self) -> &ProcessMonitor {
        &self.inner.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Copy of the current status.
    pub fn get_status(&self) -> SandboxInstance {
        lock(&self.inner.status).clone()
    }

    pub fn state(&self) -> SandboxState {
        lock(&self.inner.status).state
    }

    /// Change boot settings. Takes effect on the next `start()`.
    pub fn configure(&self, options: SandboxOptions) -> OrchestratorResult<()> {
        options.validate()?;
        {
            let mut settings = lock(&self.inner.settings);
            if let Some(v) = options.memory_mb {
                settings.memory_mb = v;
            }
            if let Some(v) = options.cpu_count {
                settings.cpu_count = v;
            }
            if let Some(v) = options.storage_mb {
                settings.storage_mb = v;
            }
            if let Some(v) = options.persistent {
                settings.persistent = v;
            }
            if let Some(v) = options.network {
                settings.network = v;
            }
        }
        if let Some(overlay) = options.overlay {
            *lock(&self.inner.overlay) = Some(overlay);
        }
        info!("sandbox options updated, effective on next start");
        Ok(())
    }

    /// Boot the sandbox and bring up its services.
    ///
    /// No-op while starting or running. Fails, leaving the instance in
    /// `error`, only when a mandatory stage (boot, runtime) fails.
    pub async fn start(&self) -> OrchestratorResult<()> {
        if matches!(self.state(), SandboxState::Starting | SandboxState::Running) {
            debug!("start ignored, already {}", self.state());
            return Ok(());
        }
        let mut slot = self.inner.sandbox.lock().await;
        // Re-check: another caller may have started while we waited.
        if matches!(self.state(), SandboxState::Starting | SandboxState::Running) {
            return Ok(());
        }
        if let Some(stale) = slot.take() {
            discard(stale).await;
        }

        let settings = lock(&self.inner.settings).clone();
        let spec = BootSpec {
            id: Uuid::new_v4(),
            image: settings.image.clone(),
            mounts: settings.mounts.clone(),
            resources: settings.resources(),
            persistent: settings.persistent,
            network: settings.network,
        };
        let id = spec.id;
        self.inner.update(|s| {
            s.sandbox_id = Some(id);
            s.resources = ResourceSnapshot {
                memory_mb: settings.memory_mb,
                cpu_count: settings.cpu_count,
                storage_mb: settings.storage_mb,
                usage: None,
            };
        });
        self.inner.set_state(SandboxState::Starting);
        info!(%id, backend = self.inner.factory.name(), "starting sandbox");

        // Stage 1: boot.
        match self.boot(spec).await {
            Ok(sandbox) => *slot = Some(sandbox),
            Err(e) => return Err(self.inner.fail("boot", e)),
        }

        // Stage 2: language runtime.
        let runtime = stages::ensure_runtime(&self.inner.bridge, &self.inner.runtime).await;
        if let Err(message) = runtime {
            if let Some(sandbox) = slot.take() {
                self.inner.bridge.detach().await;
                discard(sandbox).await;
            }
            return Err(self.inner.fail("runtime", message));
        }
        self.inner.set_service(Service::Runtime, true);

        // Stages 3-5 are chained; a failure skips the rest of the chain.
        self.bring_up_chain().await;

        // Stage 6 needs prior overlay configuration and a ready proxy.
        let overlay = lock(&self.inner.overlay).clone();
        let proxy_ready = lock(&self.inner.status).services.proxy;
        if let Some(overlay) = overlay
            && proxy_ready
        {
            self.start_service(Service::Overlay, stages::overlay_config(&overlay))
                .await;
        }

        self.inner.monitor.add_target(&id.to_string());
        self.inner.update(|s| {
            s.ready = true;
            s.error = None;
            s.uptime_ms = 0;
        });
        self.inner.set_state(SandboxState::Running);
        self.spawn_uptime_tick();
        self.inner.events.emit(Event::Started);
        info!(%id, services = ?self.get_status().services.ready(), "sandbox running");
        Ok(())
    }

    /// Tear down services and the sandbox. Deployed functions are kept.
    pub async fn stop(&self) -> OrchestratorResult<()> {
        if matches!(self.state(), SandboxState::Stopped | SandboxState::Stopping) {
            debug!("stop ignored, already {}", self.state());
            return Ok(());
        }
        let mut slot = self.inner.sandbox.lock().await;
        if self.state() == SandboxState::Stopped {
            return Ok(());
        }
        self.inner.set_state(SandboxState::Stopping);
        if let Some(token) = lock(&self.inner.uptime).take() {
            token.cancel();
        }
        self.inner.monitor.stop_monitoring();

        let services = self.get_status().services;
        for service in TEARDOWN {
            if !services.get(service) {
                continue;
            }
            if let Some(kind) = stages::service_kind(service)
                && let Err(e) = self.inner.bridge.stop_service(kind).await
            {
                warn!(%service, error = %e, "service did not stop cleanly");
            }
        }

        let mut result = Ok(());
        if let Some(mut sandbox) = slot.take() {
            if self.inner.bridge.is_attached() {
                let grace = self.inner.bridge.timeouts().get(Category::Ping);
                if !self.inner.bridge.shutdown(grace).await {
                    debug!("guest did not acknowledge shutdown");
                }
            }
            self.inner.bridge.detach().await;
            if let Err(e) = sandbox.stop().await {
                error!(error = %e, "sandbox stop failed");
                result = Err(e.into());
            }
        } else {
            self.inner.bridge.detach().await;
        }

        let previous = self.get_status();
        if let Some(id) = previous.sandbox_id {
            self.inner.monitor.remove_target(&id.to_string());
        }
        self.inner.clear_services();
        self.inner.update(|s| {
            s.ready = false;
            s.uptime_ms = 0;
            s.resources.usage = None;
        });
        self.inner.set_state(SandboxState::Stopped);
        self.inner.events.emit(Event::Stopped);
        info!("sandbox stopped");
        result
    }

    /// `stop()` then `start()`. The function registry is untouched.
    pub async fn restart(&self) -> OrchestratorResult<()> {
        self.stop().await?;
        self.start().await
    }

    /// Store a fresh resource measurement in the status snapshot.
    pub async fn refresh_resources(&self) {
        let Some(id) = self.get_status().sandbox_id else {
            return;
        };
        if self.state() != SandboxState::Running {
            return;
        }
        let usage = self
            .inner
            .monitor
            .get_system_resources(&id.to_string())
            .await;
        if usage.is_some() {
            self.inner.update(|s| s.resources.usage = usage);
        }
    }

    async fn boot(&self, spec: BootSpec) -> OrchestratorResult<Box<dyn Sandbox>> {
        let mut sandbox = self.inner.factory.create(spec).await?;
        let channel = match sandbox.start().await {
            Ok(channel) => channel,
            Err(e) => {
                discard(sandbox).await;
                return Err(e.into());
            }
        };
        self.inner.bridge.attach(channel.reader, channel.writer).await;
        if let Err(e) = self.inner.bridge.handshake().await {
            self.inner.bridge.detach().await;
            discard(sandbox).await;
            return Err(e.into());
        }
        info!(id = sandbox.id(), "sandbox booted");
        Ok(sandbox)
    }

    async fn bring_up_chain(&self) {
        let Some(gateway_port) = self
            .start_service(Service::Gateway, stages::gateway_config())
            .await
        else {
            return;
        };
        let Some(functions_port) = self
            .start_service(
                Service::Functions,
                stages::functions_config(&self.inner.functions),
            )
            .await
        else {
            return;
        };
        let routes = stages::route_table(gateway_port, functions_port);
        self.start_service(Service::Proxy, stages::proxy_config(&routes))
            .await;
    }

    /// Start one optional service. `None` when it failed; otherwise the port
    /// it reported, if any.
    async fn start_service(&self, service: Service, config: Value) -> Option<Option<u16>> {
        let kind = stages::service_kind(service)?;
        match self.inner.bridge.start_service(kind, config).await {
            Ok(port) => {
                info!(%service, ?port, "service ready");
                self.inner.set_service(service, true);
                Some(port)
            }
            Err(e) => {
                warn!(%service, error = %e, "service failed to start");
                self.inner.set_service(service, false);
                None
            }
        }
    }

    fn spawn_uptime_tick(&self) {
        let token = CancellationToken::new();
        let previous = lock(&self.inner.uptime).replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        tokio::spawn(uptime_tick(Arc::downgrade(&self.inner), token));
    }
}

/// Advance `uptime_ms` once per tick while running, and notice a guest that
/// went away underneath us.
async fn uptime_tick(inner: Weak<Inner>, token: CancellationToken) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + UPTIME_TICK, UPTIME_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.bridge.is_attached() {
            inner.channel_lost();
            break;
        }
        let uptime = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        inner.update(|s| s.uptime_ms = uptime);
    }
}

impl Inner {
    fn update(&self, f: impl FnOnce(&mut SandboxInstance)) {
        f(&mut lock(&self.status));
    }

    fn set_state(&self, to: SandboxState) {
        let from = {
            let mut status = lock(&self.status);
            std::mem::replace(&mut status.state, to)
        };
        if from != to {
            debug!(%from, %to, "state changed");
            self.events.emit(Event::StateChanged { from, to });
        }
    }

    fn set_service(&self, service: Service, ready: bool) {
        let changed = lock(&self.status).services.set(service, ready);
        if changed {
            self.events.emit(Event::ServiceChanged { service, ready });
        }
    }

    fn clear_services(&self) {
        for service in Service::ALL {
            self.set_service(service, false);
        }
    }

    /// Move to `error` after a failed mandatory stage.
    fn fail(&self, stage: &'static str, cause: impl std::fmt::Display) -> OrchestratorError {
        let message = cause.to_string();
        error!(stage, error = %message, "sandbox start failed");
        self.clear_services();
        self.update(|s| {
            s.ready = false;
            s.error = Some(message.clone());
        });
        self.set_state(SandboxState::Error);
        self.events.emit(Event::Error {
            message: message.clone(),
        });
        OrchestratorError::Initialization { stage, message }
    }

    /// The guest channel closed while running.
    fn channel_lost(&self) {
        let message = "sandbox channel closed unexpectedly".to_string();
        {
            let mut status = lock(&self.status);
            if status.state != SandboxState::Running {
                return;
            }
            status.ready = false;
            status.error = Some(message.clone());
        }
        error!("{message}");
        self.clear_services();
        self.set_state(SandboxState::Error);
        self.events.emit(Event::Error { message });
    }
}

/// Best-effort kill of a sandbox we are giving up on.
async fn discard(mut sandbox: Box<dyn Sandbox>) {
    if let Err(e) = sandbox.kill().await {
        warn!(id = sandbox.id(), error = %e, "failed to kill sandbox");
    }
}
