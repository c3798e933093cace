//! Shared helpers for orchestrator tests.

#![allow(dead_code)]

use std::time::Duration;

use exthost_core::{EventBusReceiver, ExtensionIdentifier, OrchestratorEvent};

pub fn id(value: &str) -> ExtensionIdentifier {
    ExtensionIdentifier::new(value)
}

/// Receive events until one matches `predicate`.
///
/// # Panics
///
/// When nothing matches within two seconds.
pub async fn next_matching(
    rx: &mut EventBusReceiver,
    mut predicate: impl FnMut(&OrchestratorEvent) -> bool,
) -> OrchestratorEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some((event, _))) if predicate(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event bus closed"),
            Err(_) => panic!("no matching event within 2s"),
        }
    }
}

/// Notification text published so far, draining the receiver.
pub fn notification_messages(rx: &mut EventBusReceiver) -> Vec<String> {
    rx.drain()
        .into_iter()
        .filter_map(|event| match event {
            OrchestratorEvent::Notification { message, .. } => Some(message),
            _ => None,
        })
        .collect()
}
