use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Stable error taxonomy shared by every component that talks to the sandbox.
///
/// Callers branch on the kind, never on concrete error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The sandbox or a dependent service could not be brought up.
    Initialization,
    /// The operation referenced an unknown target or unit.
    NotFound,
    /// Any other client-class (4xx-equivalent) rejection.
    Client,
    /// The message channel or network path failed.
    Transport,
    /// The operation did not settle before its deadline.
    Timeout,
    /// Refused by an open circuit breaker.
    CircuitOpen,
    /// Refused by the concurrency limiter.
    ConcurrencyLimit,
    /// User code failed inside the sandbox.
    Execution,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Transient errors are the only ones the retry loop will repeat.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Transport | Self::Timeout)
    }

    pub fn is_client(self) -> bool {
        matches!(self, Self::NotFound | Self::Client)
    }

    /// Whether a failure of this kind says the dependency itself is unhealthy.
    /// Client mistakes and user code failing inside a healthy sandbox do not.
    pub fn trips_breaker(self) -> bool {
        !(self.is_client() || self == Self::Execution)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialization => "initialization_failure",
            Self::NotFound => "not_found",
            Self::Client => "client_error",
            Self::Transport => "transport_failure",
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::ConcurrencyLimit => "concurrency_limit_exceeded",
            Self::Execution => "execution_failure",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Maps an error onto the shared taxonomy.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Classify an HTTP-style status code: 429 and 5xx are transient.
pub fn kind_for_status(status: u16) -> ErrorKind {
    match status {
        429 | 500..=599 => ErrorKind::Transport,
        404 => ErrorKind::NotFound,
        400..=499 => ErrorKind::Client,
        _ => ErrorKind::Internal,
    }
}

/// Error returned by [`Resilience::execute`](crate::Resilience::execute).
///
/// Operation errors are wrapped in [`Failed`](Self::Failed) together with the
/// operation name and target so they can be diagnosed without re-deriving
/// state.
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    #[error("concurrency limit reached ({limit} operations in flight)")]
    ConcurrencyLimitExceeded { limit: usize },

    #[error("circuit '{key}' is open")]
    CircuitOpen { key: String },

    #[error("{operation}{} timed out after {}ms", on(.target), .timeout.as_millis())]
    Timeout {
        operation: String,
        target: Option<String>,
        timeout: Duration,
    },

    #[error("{operation}{} failed after {attempts} attempt(s): {source}", on(.target))]
    Failed {
        operation: String,
        target: Option<String>,
        attempts: u32,
        #[source]
        source: E,
    },
}

fn on(target: &Option<String>) -> String {
    match target {
        Some(t) => format!(" on {t}"),
        None => String::new(),
    }
}

impl<E> ResilienceError<E> {
    /// The wrapped operation error, if the operation itself failed.
    pub fn source_error(&self) -> Option<&E> {
        match self {
            Self::Failed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Number of attempts made before giving up (0 when never admitted).
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } => *attempts,
            Self::Timeout { .. } => 1,
            _ => 0,
        }
    }
}

impl<E: Classify> Classify for ResilienceError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ConcurrencyLimitExceeded { .. } => ErrorKind::ConcurrencyLimit,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Failed { source, .. } => source.kind(),
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            Self::Failed { source, .. } => source.is_transient(),
            other => other.kind().is_transient(),
        }
    }
}
