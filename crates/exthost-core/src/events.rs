//! Orchestrator event bus.
//!
//! Every state change the embedder may care about is published here. The
//! bus is a broadcast channel: each subscriber sees every event published
//! after it subscribed, in publication order.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::defaults;
use crate::description::ExtensionIdentifier;
use crate::host::ExtensionHostKind;

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Events published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// The initial scan has been registered.
    DidRegisterExtensions,
    /// A delta was committed to the registry.
    DidChangeExtensions {
        added: Vec<ExtensionIdentifier>,
        removed: Vec<ExtensionIdentifier>,
    },
    /// Activation or runtime status of these extensions changed.
    DidChangeExtensionsStatus { extension_ids: Vec<ExtensionIdentifier> },
    /// Activation event about to be dispatched to the hosts.
    WillActivateByEvent { event: String },
    DidChangeResponsiveState {
        kind: ExtensionHostKind,
        is_responsive: bool,
    },
    Notification { severity: Severity, message: String },
    /// A development host exited; the embedder should shut down.
    HostExitRequested { code: i32 },
}

impl OrchestratorEvent {
    /// Type name used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DidRegisterExtensions => "DidRegisterExtensions",
            Self::DidChangeExtensions { .. } => "DidChangeExtensions",
            Self::DidChangeExtensionsStatus { .. } => "DidChangeExtensionsStatus",
            Self::WillActivateByEvent { .. } => "WillActivateByEvent",
            Self::DidChangeResponsiveState { .. } => "DidChangeResponsiveState",
            Self::Notification { .. } => "Notification",
            Self::HostExitRequested { .. } => "HostExitRequested",
        }
    }

    pub fn is_status_event(&self) -> bool {
        matches!(self, Self::DidChangeExtensionsStatus { .. })
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification { .. })
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: String,
    /// Component that published the event.
    pub source: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Broadcast bus for [`OrchestratorEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(OrchestratorEvent, EventMetadata)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(defaults::EVENT_CHANNEL_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event. Returns `true` if at least one subscriber got it.
    pub fn publish(&self, event: OrchestratorEvent) -> bool {
        self.publish_with_source(event, "orchestrator")
    }

    pub fn publish_with_source(&self, event: OrchestratorEvent, source: impl Into<String>) -> bool {
        tracing::trace!(event = event.type_name(), "Publishing event");
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(OrchestratorEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event. Returns `None` once the bus is gone.
    ///
    /// A lagging receiver skips the events it missed and carries on.
    pub async fn recv(&mut self) -> Option<(OrchestratorEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(OrchestratorEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Some((event, _)) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(OrchestratorEvent::DidRegisterExtensions));
        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event, OrchestratorEvent::DidRegisterExtensions);
        assert_eq!(meta.source, "orchestrator");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.publish(OrchestratorEvent::DidRegisterExtensions));
    }

    #[tokio::test]
    async fn test_delivery_order_is_publication_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        for event in ["a", "b", "c"] {
            bus.publish(OrchestratorEvent::WillActivateByEvent {
                event: event.to_string(),
            });
        }

        for rx in [&mut first, &mut second] {
            let names: Vec<String> = rx
                .drain()
                .into_iter()
                .map(|e| match e {
                    OrchestratorEvent::WillActivateByEvent { event } => event,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert_eq!(names, vec!["a", "b", "c"]);
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = OrchestratorEvent::Notification {
            severity: Severity::Error,
            message: "loop".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["severity"], "error");
    }
}
