use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use sandbox::{BootSpec, GuestChannel, Sandbox, SandboxError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{info, warn};

use crate::config::ProcessConfig;
use crate::process::signal_process_group;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl SandboxState {
    fn from_u8(v: u8) -> Self {
        debug_assert!(v <= 3, "invalid SandboxState: {v}");
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

pub struct ProcessSandbox {
    config: ProcessConfig,
    spec: BootSpec,
    /// Cached `spec.id.to_string()`.
    id: String,
    process: Option<Child>,
    /// Lifecycle state, shared with the stderr task for crash detection.
    state: Arc<AtomicU8>,
}

impl ProcessSandbox {
    pub(crate) fn new(config: ProcessConfig, spec: BootSpec) -> Self {
        let id = spec.id.to_string();
        Self {
            config,
            spec,
            id,
            process: None,
            state: Arc::new(AtomicU8::new(SandboxState::Created as u8)),
        }
    }

    fn current_state(&self) -> SandboxState {
        SandboxState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.current_state() == SandboxState::Running
    }

    /// Atomically transition between states using CAS. Returns `true` if the
    /// transition succeeded, `false` if the current state did not match `from`.
    fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(self.config.expand_args(&self.spec))
            .envs(&self.config.env)
            .env("SANDBOX_ID", &self.id)
            .env("SANDBOX_IMAGE", &self.spec.image)
            .env("SANDBOX_PERSISTENT", if self.spec.persistent { "1" } else { "0" })
            .env("SANDBOX_NETWORK", if self.spec.network { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Signal the process group and reap it, escalating to SIGKILL after
    /// `grace`.
    async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.process.take() else {
            return;
        };

        if !grace.is_zero() {
            signal_process_group(&child, Signal::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
            warn!(id = %self.id, "graceful stop timed out, killing");
        }

        signal_process_group(&child, Signal::SIGKILL);
        // Reap the zombie process.
        let _ = child.wait().await;
    }
}

/// Forward stderr to the log until the pipe closes.
///
/// The program exits when stderr closes; if the state is still `Running`, that
/// exit was unexpected and the state moves to `Stopped`.
fn monitor_process(id: &str, stderr: ChildStderr, state: Arc<AtomicU8>) {
    let id = id.to_owned();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                warn!(id = %id, "stderr: {line}");
            }
        }
        // Pipe closed, process exited.
        let prev = state.compare_exchange(
            SandboxState::Running as u8,
            SandboxState::Stopped as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if prev.is_ok() {
            warn!(id = %id, "process exited unexpectedly");
        }
    });
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&mut self) -> sandbox::Result<GuestChannel> {
        let state = self.current_state();
        if state != SandboxState::Created {
            return Err(SandboxError::InvalidState {
                id: self.id.clone(),
                state: state.as_str(),
            });
        }

        let mut child = self.command().spawn().map_err(|e| {
            SandboxError::StartFailed(format!("spawn {}: {e}", self.config.program.display()))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(SandboxError::StartFailed("child stdio not captured".into()));
        };

        self.state
            .store(SandboxState::Running as u8, Ordering::Release);
        monitor_process(&self.id, stderr, Arc::clone(&self.state));
        info!(
            id = %self.id,
            pid = child.id(),
            memory_mb = self.spec.resources.memory_mb,
            cpus = self.spec.resources.cpu_count,
            "sandbox started"
        );
        self.process = Some(child);

        Ok(GuestChannel::new(stdout, stdin))
    }

    async fn stop(&mut self) -> sandbox::Result<()> {
        if !self.transition(SandboxState::Running, SandboxState::Stopping) {
            // Already stopped or crashed; still reap whatever is left.
            self.terminate(Duration::ZERO).await;
            return Ok(());
        }
        self.terminate(Duration::from_millis(self.config.stop_timeout_ms))
            .await;
        self.state
            .store(SandboxState::Stopped as u8, Ordering::Release);
        info!(id = %self.id, "sandbox stopped");
        Ok(())
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        if !self.transition(SandboxState::Running, SandboxState::Stopping) {
            self.terminate(Duration::ZERO).await;
            return Ok(());
        }
        self.terminate(Duration::ZERO).await;
        self.state
            .store(SandboxState::Stopped as u8, Ordering::Release);
        info!(id = %self.id, "sandbox killed");
        Ok(())
    }
}
