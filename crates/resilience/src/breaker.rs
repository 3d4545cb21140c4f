use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub(crate) const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub(crate) const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Open => f.write_str("open"),
            Self::HalfOpen => f.write_str("half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a probe is admitted.
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Point-in-time copy of one breaker's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<Instant>,
}

/// How a call was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Normal,
    Probe,
}

/// How a call settled, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failure,
    /// Neither success nor failure: client-class error or cancelled call.
    Released,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub(crate) fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }

    pub(crate) fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_at: self.last_failure_at,
        }
    }

    /// Decide whether a call may proceed. `None` means rejected.
    pub(crate) fn admit(&mut self, config: &BreakerConfig, now: Instant) -> Option<Admission> {
        match self.state {
            BreakerState::Closed => Some(Admission::Normal),
            BreakerState::Open => {
                let cooled = self
                    .last_failure_at
                    .is_none_or(|at| now.duration_since(at) >= config.reset_timeout());
                if !cooled {
                    return None;
                }
                self.state = BreakerState::HalfOpen;
                self.probe_in_flight = true;
                Some(Admission::Probe)
            }
            BreakerState::HalfOpen => {
                if self.probe_in_flight {
                    return None;
                }
                self.probe_in_flight = true;
                Some(Admission::Probe)
            }
        }
    }

    /// Record how an admitted call settled. Returns the new state when it changed.
    pub(crate) fn record(
        &mut self,
        admission: Admission,
        outcome: Outcome,
        config: &BreakerConfig,
        now: Instant,
    ) -> Option<BreakerState> {
        let before = self.state;
        match (admission, outcome) {
            (Admission::Probe, Outcome::Success) => {
                self.state = BreakerState::Closed;
                self.failure_count = 0;
                self.success_count = 0;
                self.probe_in_flight = false;
            }
            (Admission::Probe, Outcome::Failure) => {
                self.state = BreakerState::Open;
                self.failure_count = self.failure_count.saturating_add(1);
                self.last_failure_at = Some(now);
                self.probe_in_flight = false;
            }
            (Admission::Probe, Outcome::Released) => {
                self.probe_in_flight = false;
            }
            (Admission::Normal, Outcome::Success) => {
                if self.state == BreakerState::Closed {
                    self.failure_count = 0;
                    self.success_count = self.success_count.saturating_add(1);
                }
            }
            (Admission::Normal, Outcome::Failure) => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.last_failure_at = Some(now);
                if self.state == BreakerState::Closed
                    && self.failure_count >= config.failure_threshold.max(1)
                {
                    self.state = BreakerState::Open;
                }
            }
            (Admission::Normal, Outcome::Released) => {}
        }
        (self.state != before).then_some(self.state)
    }
}
