use std::time::Duration;

use resilience::Policy;
use serde::{Deserialize, Serialize};

/// Kind of exchange, selecting its timeout, retry policy and breaker key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Ping,
    /// Short console command.
    Command,
    /// Long-running console command (package installs).
    Install,
    Service,
    Invoke,
    Proxy,
}

impl Category {
    pub fn breaker_key(self) -> Option<&'static str> {
        match self {
            Self::Ping => None,
            Self::Command | Self::Install => Some("command-exec"),
            Self::Service => Some("service"),
            Self::Invoke => Some("function-invoke"),
            Self::Proxy => Some("proxy"),
        }
    }

    /// Only exchanges without side effects on a repeat are retried.
    pub fn retryable(self) -> bool {
        matches!(self, Self::Ping | Self::Service | Self::Proxy)
    }
}

/// Per-category exchange deadlines in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub ping_ms: u64,
    pub command_ms: u64,
    pub install_ms: u64,
    pub service_ms: u64,
    pub invoke_ms: u64,
    pub proxy_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ping_ms: 5_000,
            command_ms: 30_000,
            install_ms: 300_000,
            service_ms: 60_000,
            invoke_ms: 30_000,
            proxy_ms: 10_000,
        }
    }
}

impl Timeouts {
    pub fn get(&self, category: Category) -> Duration {
        let ms = match category {
            Category::Ping => self.ping_ms,
            Category::Command => self.command_ms,
            Category::Install => self.install_ms,
            Category::Service => self.service_ms,
            Category::Invoke => self.invoke_ms,
            Category::Proxy => self.proxy_ms,
        };
        Duration::from_millis(ms)
    }

    pub(crate) fn policy(&self, category: Category, operation: &str) -> Policy {
        let mut policy =
            Policy::new(operation, self.get(category)).retryable(category.retryable());
        if let Some(key) = category.breaker_key() {
            policy = policy.breaker(key);
        }
        policy
    }
}
