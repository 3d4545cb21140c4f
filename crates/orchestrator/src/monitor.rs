//! Advisory process telemetry for the guest.
//!
//! Everything here runs shell commands through the bridge console and parses
//! their output. Failures are logged and degrade to an empty result; nothing
//! in this module returns an error to its caller.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bridge::Bridge;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;

const PS_COMMAND: &str = "ps -eo pid=,stat=,pcpu=,rss=,etimes=,args=";
const RESOURCES_COMMAND: &str = "echo '#mem'; cat /proc/meminfo; echo '#load'; cat /proc/loadavg; \
     echo '#cpus'; nproc; echo '#disk'; df -Pk / | tail -n 1";
const MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Crashed,
}

impl ProcessStatus {
    /// Map a `ps` STAT column onto a status.
    fn from_stat(stat: &str) -> Self {
        match stat.chars().next() {
            Some('Z' | 'X') => Self::Crashed,
            Some('T' | 't') => Self::Stopped,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: u32,
    pub command: String,
    pub status: ProcessStatus,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub started_at: DateTime<Utc>,
    pub log_lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemResources {
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub cpu_count: u32,
    /// One-minute load average as a share of all CPUs, capped at 100.
    pub cpu_percent: f64,
    pub disk_total_mb: u64,
    pub disk_used_mb: u64,
}

/// Polls process state inside the guest and caches it per target.
///
/// Clone is a cheap Arc refcount bump; clones share the cache and poller.
#[derive(Clone)]
pub struct ProcessMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    bridge: Bridge,
    config: MonitorConfig,
    targets: Mutex<BTreeSet<String>>,
    cache: Mutex<HashMap<String, Vec<ProcessRecord>>>,
    poller: Mutex<Option<Poller>>,
}

struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessMonitor {
    pub fn new(bridge: Bridge, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                bridge,
                config,
                targets: Mutex::new(BTreeSet::new()),
                cache: Mutex::new(HashMap::new()),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Register a target to be refreshed on every tick.
    pub fn add_target(&self, target: &str) {
        lock(&self.inner.targets).insert(target.to_string());
    }

    /// Stop refreshing `target` and drop its cached records.
    pub fn remove_target(&self, target: &str) {
        lock(&self.inner.targets).remove(target);
        lock(&self.inner.cache).remove(target);
    }

    pub fn targets(&self) -> Vec<String> {
        lock(&self.inner.targets).iter().cloned().collect()
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.inner.poller).is_some()
    }

    /// Start (or restart with a new interval) the background refresh.
    pub fn start_monitoring(&self, interval: Duration) {
        let interval = interval.max(MIN_INTERVAL);
        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            interval,
            token.clone(),
        ));
        let previous = lock(&self.inner.poller).replace(Poller { token, handle });
        if let Some(previous) = previous {
            previous.token.cancel();
            previous.handle.abort();
        }
        info!(?interval, "process monitoring started");
    }

    /// Stop the background refresh and clear the cache.
    pub fn stop_monitoring(&self) {
        let Some(poller) = lock(&self.inner.poller).take() else {
            return;
        };
        poller.token.cancel();
        poller.handle.abort();
        lock(&self.inner.cache).clear();
        info!("process monitoring stopped");
    }

    /// Processes in `target`, from the cache while monitoring, else fetched now.
    pub async fn get_processes(&self, target: &str) -> Vec<ProcessRecord> {
        if self.is_monitoring()
            && let Some(cached) = self.cached(target)
        {
            return cached;
        }
        self.inner.fetch_processes().await.unwrap_or_default()
    }

    pub async fn get_system_resources(&self, target: &str) -> Option<SystemResources> {
        let output = self.inner.run(RESOURCES_COMMAND).await?;
        let resources = parse_resources(&output);
        if resources.is_none() {
            warn!(target, "unrecognised resource report");
        }
        resources
    }

    /// SIGTERM, then SIGKILL if the process outlives the grace period.
    /// Returns `true` once the process is gone.
    pub async fn kill_process(&self, target: &str, pid: u32) -> bool {
        if !self.inner.killable(pid) {
            return false;
        }
        let grace = self.inner.config.kill_grace_secs;
        let command = format!(
            "kill -TERM {pid} || exit 1; i=0; \
             while kill -0 {pid} 2>/dev/null && [ $i -lt {grace} ]; do sleep 1; i=$((i+1)); done; \
             if kill -0 {pid} 2>/dev/null; then kill -KILL {pid}; fi"
        );
        self.finish_kill(target, pid, &command).await
    }

    pub async fn force_kill_process(&self, target: &str, pid: u32) -> bool {
        if !self.inner.killable(pid) {
            return false;
        }
        self.finish_kill(target, pid, &format!("kill -KILL {pid}"))
            .await
    }

    async fn finish_kill(&self, target: &str, pid: u32, command: &str) -> bool {
        if self.inner.run(command).await.is_none() {
            return false;
        }
        if let Some(records) = lock(&self.inner.cache).get_mut(target) {
            records.retain(|r| r.pid != pid);
        }
        info!(target, pid, "process killed");
        true
    }

    /// Last `lines` lines of the process's log file. Also attached to the
    /// cached record, if there is one.
    pub async fn get_process_logs(&self, target: &str, pid: u32, lines: usize) -> Vec<String> {
        let path = format!("{}/{pid}.log", self.inner.config.log_dir.trim_end_matches('/'));
        let command = format!("tail -n {lines} {}", shell_quote(&path));
        let Some(output) = self.inner.run(&command).await else {
            return Vec::new();
        };
        let logs: Vec<String> = output.lines().map(str::to_string).collect();
        if let Some(record) = lock(&self.inner.cache)
            .get_mut(target)
            .and_then(|records| records.iter_mut().find(|r| r.pid == pid))
        {
            record.log_lines.clone_from(&logs);
        }
        logs
    }

    /// Whether something inside the guest accepts connections on `port`.
    pub async fn is_process_responding(&self, port: u16) -> bool {
        self.inner
            .run(&format!("nc -z 127.0.0.1 {port}"))
            .await
            .is_some()
    }

    fn cached(&self, target: &str) -> Option<Vec<ProcessRecord>> {
        lock(&self.inner.cache).get(target).cloned()
    }
}

impl Inner {
    /// Run a console command, returning stdout on exit 0.
    async fn run(&self, command: &str) -> Option<String> {
        match self.bridge.exec(command).await {
            Ok(out) if out.success() => Some(out.stdout),
            Ok(out) => {
                warn!(
                    command,
                    exit_code = out.exit_code,
                    stderr = %out.stderr.trim(),
                    "monitor command failed"
                );
                None
            }
            Err(e) => {
                warn!(command, error = %e, "monitor command failed");
                None
            }
        }
    }

    async fn fetch_processes(&self) -> Option<Vec<ProcessRecord>> {
        let output = self.run(PS_COMMAND).await?;
        Some(parse_processes(&output, self.config.min_pid, Utc::now()))
    }

    fn killable(&self, pid: u32) -> bool {
        if pid < self.config.min_pid {
            warn!(pid, min_pid = self.config.min_pid, "refusing to signal a system process");
            return false;
        }
        true
    }

    async fn refresh(&self) {
        let targets: Vec<String> = lock(&self.targets).iter().cloned().collect();
        for target in targets {
            // A failed poll keeps the previous snapshot.
            if let Some(records) = self.fetch_processes().await {
                debug!(target = %target, count = records.len(), "process cache refreshed");
                lock(&self.cache).insert(target, records);
            }
        }
    }
}

async fn poll_loop(inner: Weak<Inner>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.refresh().await;
    }
}

/// Parse `ps -eo pid=,stat=,pcpu=,rss=,etimes=,args=` output.
///
/// Malformed lines and PIDs below `min_pid` are dropped.
pub fn parse_processes(output: &str, min_pid: u32, now: DateTime<Utc>) -> Vec<ProcessRecord> {
    output
        .lines()
        .filter_map(|line| parse_process_line(line, now))
        .filter(|r| r.pid >= min_pid)
        .collect()
}

fn parse_process_line(line: &str, now: DateTime<Utc>) -> Option<ProcessRecord> {
    let mut fields = line.split_whitespace();
    let pid: u32 = fields.next()?.parse().ok()?;
    let stat = fields.next()?;
    let cpu_percent: f64 = fields.next()?.parse().ok()?;
    let rss_kb: u64 = fields.next()?.parse().ok()?;
    let elapsed_secs: i64 = fields.next()?.parse().ok()?;
    let command = fields.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    let started_at = now.checked_sub_signed(TimeDelta::try_seconds(elapsed_secs)?)?;
    Some(ProcessRecord {
        pid,
        command,
        status: ProcessStatus::from_stat(stat),
        cpu_percent,
        memory_mb: rss_kb as f64 / 1024.0,
        started_at,
        log_lines: Vec::new(),
    })
}

/// Parse the sectioned output of [`RESOURCES_COMMAND`].
fn parse_resources(output: &str) -> Option<SystemResources> {
    let mut section = "";
    let mut mem_total_kb = None;
    let mut mem_available_kb = None;
    let mut load = None;
    let mut cpus = None;
    let mut disk = None;

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(name) = line.strip_prefix('#') {
            section = name;
            continue;
        }
        let mut fields = line.split_whitespace();
        match section {
            "mem" => {
                let key = fields.next();
                let value = fields.next().and_then(|v| v.parse::<u64>().ok());
                match key {
                    Some("MemTotal:") => mem_total_kb = value,
                    Some("MemAvailable:") => mem_available_kb = value,
                    _ => {}
                }
            }
            "load" => load = fields.next().and_then(|v| v.parse::<f64>().ok()),
            "cpus" => cpus = fields.next().and_then(|v| v.parse::<u32>().ok()),
            "disk" => {
                let total = fields.nth(1).and_then(|v| v.parse::<u64>().ok());
                let used = fields.next().and_then(|v| v.parse::<u64>().ok());
                disk = total.zip(used);
            }
            _ => {}
        }
    }

    let total_kb = mem_total_kb?;
    let available_kb = mem_available_kb.unwrap_or(total_kb);
    let cpu_count = cpus.unwrap_or(1).max(1);
    let cpu_percent = (load.unwrap_or(0.0) / f64::from(cpu_count) * 100.0).min(100.0);
    let (disk_total_kb, disk_used_kb) = disk.unwrap_or((0, 0));
    Some(SystemResources {
        memory_total_mb: total_kb / 1024,
        memory_used_mb: total_kb.saturating_sub(available_kb) / 1024,
        cpu_count,
        cpu_percent,
        disk_total_mb: disk_total_kb / 1024,
        disk_used_mb: disk_used_kb / 1024,
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
