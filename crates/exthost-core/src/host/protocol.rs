//! Line protocol between a process host and its runner.
//!
//! One JSON object per line. Requests carry a `request_id`; the runner
//! answers each with exactly one reply carrying the same id. Activation
//! progress is reported with unsolicited events that carry no id.

use serde::{Deserialize, Serialize};

use super::{ActivationKind, ActivationReason, ActivationTimes, HostNotification};
use crate::description::{ExtensionDescription, ExtensionIdentifier};
use crate::error::{HostError, Result};
use crate::host::ExtensionHostKind;

pub const HOST_PROTOCOL_VERSION: u32 = 1;

/// Messages sent to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostRequest {
    Start {
        request_id: u64,
        protocol_version: u32,
        host_kind: ExtensionHostKind,
        #[serde(default)]
        all_extensions: Vec<ExtensionDescription>,
        #[serde(default)]
        my_extensions: Vec<ExtensionIdentifier>,
    },
    Activate {
        request_id: u64,
        extension_id: ExtensionIdentifier,
        reason: ActivationReason,
    },
    ActivateByEvent {
        request_id: u64,
        event: String,
        #[serde(default)]
        activation_kind: ActivationKind,
    },
    DeltaExtensions {
        request_id: u64,
        #[serde(default)]
        to_add: Vec<ExtensionDescription>,
        #[serde(default)]
        to_remove: Vec<ExtensionIdentifier>,
    },
    Ping {
        request_id: u64,
    },
    Shutdown {
        request_id: u64,
    },
}

impl HostRequest {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Start { request_id, .. }
            | Self::Activate { request_id, .. }
            | Self::ActivateByEvent { request_id, .. }
            | Self::DeltaExtensions { request_id, .. }
            | Self::Ping { request_id }
            | Self::Shutdown { request_id } => *request_id,
        }
    }
}

/// Messages sent by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunnerMessage {
    Ack {
        request_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },
    Activated {
        request_id: u64,
        activated: bool,
    },
    Failed {
        request_id: u64,
        error: String,
    },
    Pong {
        request_id: u64,
    },
    WillActivate {
        extension_id: ExtensionIdentifier,
    },
    DidActivate {
        extension_id: ExtensionIdentifier,
        #[serde(default)]
        times: ActivationTimes,
    },
    ActivationError {
        extension_id: ExtensionIdentifier,
        error: String,
    },
    RuntimeError {
        extension_id: ExtensionIdentifier,
        error: String,
    },
}

impl RunnerMessage {
    /// Id of the request this message answers, if it is a reply.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Ack { request_id, .. }
            | Self::Activated { request_id, .. }
            | Self::Failed { request_id, .. }
            | Self::Pong { request_id } => Some(*request_id),
            _ => None,
        }
    }

    /// The host notification carried by an unsolicited event.
    pub fn into_notification(self) -> Option<HostNotification> {
        match self {
            Self::WillActivate { extension_id } => {
                Some(HostNotification::WillActivateExtension(extension_id))
            }
            Self::DidActivate {
                extension_id,
                times,
            } => Some(HostNotification::DidActivateExtension {
                extension_id,
                times,
            }),
            Self::ActivationError {
                extension_id,
                error,
            } => Some(HostNotification::ActivationFailed {
                extension_id,
                message: error,
            }),
            Self::RuntimeError {
                extension_id,
                error,
            } => Some(HostNotification::RuntimeError {
                extension_id,
                message: error,
            }),
            _ => None,
        }
    }
}

/// Serialize one message as a protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line. Blank lines yield `None`.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<Option<T>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| HostError::Protocol(format!("invalid message: {e}")))
}
