//! Error types for the extension host core.

use crate::description::ExtensionIdentifier;
use crate::host::ExtensionHostKind;

/// Errors surfaced by the registry, the hosts and the orchestrator.
///
/// Batch operations (deltas) never return these for individual candidates;
/// refusals are logged and reported in the delta outcome instead.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Failed to resolve extension {0}: {1}")]
    Resolution(ExtensionIdentifier, String),

    #[error("Unknown extension {0}")]
    UnknownExtension(ExtensionIdentifier),

    #[error("Activation of {extension_id} failed: {message}")]
    ActivationFailed {
        extension_id: ExtensionIdentifier,
        message: String,
    },

    #[error("Activation event {event} failed in {kind} host: {message}")]
    ActivationEventFailed {
        event: String,
        kind: ExtensionHostKind,
        message: String,
    },

    #[error("Extension host ({0}) failed to start: {1}")]
    StartFailed(ExtensionHostKind, String),

    #[error("Extension host ({0}) terminated")]
    HostTerminated(ExtensionHostKind),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other: {0}")]
    Other(String),
}

/// Result type for extension host operations.
pub type Result<T> = std::result::Result<T, HostError>;
