use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::instance::{SandboxState, Service};

const DEFAULT_EVENT_CHANNEL_SIZE: usize = 256;

/// Lifecycle and deployment notifications.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    StateChanged {
        from: SandboxState,
        to: SandboxState,
    },
    Started,
    Stopped,
    Error {
        message: String,
    },
    ServiceChanged {
        service: Service,
        ready: bool,
    },
    FunctionDeployed {
        name: String,
        version: u32,
    },
    FunctionRemoved {
        name: String,
    },
}

/// Fan-out to every current subscriber. Late subscribers get no replay and a
/// dropped receiver is an unsubscribe.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CHANNEL_SIZE)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn emit(&self, event: Event) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "no event subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_without_replay() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(Event::Started), 0);

        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.emit(Event::Stopped), 2);
        assert_eq!(a.recv().await.unwrap(), Event::Stopped);
        assert_eq!(b.recv().await.unwrap(), Event::Stopped);
        // The event sent before subscribing is not replayed.
        assert!(a.try_recv().is_err());

        drop(b);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(Event::ServiceChanged {
            service: Service::Proxy,
            ready: true,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "service_changed", "service": "proxy", "ready": true})
        );
    }
}
