//! Generic "execute with policy" wrapper for operations that cross the
//! sandbox boundary.
//!
//! Every wrapped call passes through, outermost first:
//!
//! 1. the concurrency limiter (immediate rejection when the cap is reached),
//! 2. the circuit breaker for the policy's key, if any,
//! 3. the retry loop (transient errors only, exponential backoff),
//! 4. a per-attempt timeout.
//!
//! The crate knows nothing about sandboxes; callers classify their own
//! errors through [`Classify`].

mod breaker;
mod error;
mod execute;
mod retry;

pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState};
pub use error::{Classify, ErrorKind, ResilienceError, kind_for_status};
pub use execute::{Policy, Resilience, ResilienceConfig};
pub use retry::RetryConfig;
