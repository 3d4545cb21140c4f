use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use sandbox::{BootSpec, GuestChannel, Sandbox, SandboxError, SandboxFactory};
use tokio::io::{duplex, split};
use tokio::task::JoinHandle;
use tracing::info;

use crate::GuestSim;

const CHANNEL_BUFFER: usize = 256 * 1024;

/// Sandbox factory whose sandboxes run a [`GuestSim`] in a background task.
#[derive(Clone, Default)]
pub struct SimFactory {
    sim: GuestSim,
    boots: Arc<AtomicU32>,
    fail_boot: Arc<Mutex<Option<String>>>,
    last_spec: Arc<Mutex<Option<BootSpec>>>,
}

impl SimFactory {
    pub fn new(sim: GuestSim) -> Self {
        Self {
            sim,
            ..Self::default()
        }
    }

    pub fn sim(&self) -> &GuestSim {
        &self.sim
    }

    /// Make every subsequent boot fail with `message`, or succeed again on `None`.
    pub fn fail_boot(&self, message: Option<&str>) {
        *self
            .fail_boot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = message.map(str::to_owned);
    }

    /// Number of successful boots so far.
    pub fn boots(&self) -> u32 {
        self.boots.load(Ordering::SeqCst)
    }

    /// Boot spec of the most recently created sandbox.
    pub fn last_spec(&self) -> Option<BootSpec> {
        self.last_spec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SandboxFactory for SimFactory {
    fn name(&self) -> &str {
        "sim"
    }

    async fn create(&self, spec: BootSpec) -> sandbox::Result<Box<dyn Sandbox>> {
        spec.validate()?;
        let id = spec.id.to_string();
        *self
            .last_spec
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(spec);
        Ok(Box::new(SimSandbox {
            id,
            factory: self.clone(),
            task: None,
        }))
    }
}

pub struct SimSandbox {
    id: String,
    factory: SimFactory,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Sandbox for SimSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> sandbox::Result<GuestChannel> {
        if self.task.is_some() {
            return Err(SandboxError::InvalidState {
                id: self.id.clone(),
                state: "running",
            });
        }
        let failure = self
            .factory
            .fail_boot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = failure {
            return Err(SandboxError::StartFailed(message));
        }

        let (host, guest) = duplex(CHANNEL_BUFFER);
        let (guest_r, guest_w) = split(guest);
        let sim = self.factory.sim.clone();
        let id = self.id.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = sim.serve(guest_r, guest_w).await {
                info!(id = %id, error = %e, "simulated guest exited");
            }
        }));
        self.factory.boots.fetch_add(1, Ordering::SeqCst);

        let (host_r, host_w) = split(host);
        Ok(GuestChannel::new(host_r, host_w))
    }

    async fn stop(&mut self) -> sandbox::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        self.stop().await
    }
}
