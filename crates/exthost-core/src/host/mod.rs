//! Extension host abstraction.
//!
//! An extension host is an isolated runtime that loads extension code. The
//! orchestrator never talks to one directly; every host is wrapped in an
//! [`ExtensionHostManager`] which tracks its membership and lifecycle.
//!
//! Two implementations live in this crate tree: [`ProcessExtensionHost`],
//! a child process speaking the JSON line protocol in [`protocol`], and the
//! mock host of the testing crate.

pub mod manager;
pub mod process;
pub mod protocol;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::description::{ExtensionDescription, ExtensionIdentifier};
use crate::error::Result;

pub use manager::{ExtensionHostManager, HostState};
pub use process::{ProcessExtensionHost, ProcessHostFactory};

// ============================================================================
// Kinds and reasons
// ============================================================================

/// Runtime flavour of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionHostKind {
    LocalProcess,
    LocalWebWorker,
    Remote,
}

impl ExtensionHostKind {
    pub const ALL: [ExtensionHostKind; 3] = [
        ExtensionHostKind::LocalProcess,
        ExtensionHostKind::LocalWebWorker,
        ExtensionHostKind::Remote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalProcess => "local-process",
            Self::LocalWebWorker => "local-web-worker",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ExtensionHostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalProcess => write!(f, "LocalProcess"),
            Self::LocalWebWorker => write!(f, "LocalWebWorker"),
            Self::Remote => write!(f, "Remote"),
        }
    }
}

impl std::str::FromStr for ExtensionHostKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local-process" | "localprocess" | "local" => Ok(Self::LocalProcess),
            "local-web-worker" | "localwebworker" | "web-worker" => Ok(Self::LocalWebWorker),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown extension host kind: {other}")),
        }
    }
}

/// How urgently an activation event must be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Wait until the installed extensions are registered.
    #[default]
    Normal,
    /// Dispatch to whatever hosts exist right now.
    Immediate,
}

/// When a host's runtime is booted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStartup {
    /// Started with the orchestrator, with or without extensions.
    #[default]
    Eager,
    /// Started once the first extension is routed to it.
    Lazy,
}

/// Why an extension is being activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationReason {
    pub startup: bool,
    pub extension_id: ExtensionIdentifier,
    pub activation_event: String,
}

impl ActivationReason {
    pub fn new(extension_id: ExtensionIdentifier, activation_event: impl Into<String>) -> Self {
        Self {
            startup: false,
            extension_id,
            activation_event: activation_event.into(),
        }
    }

    pub fn startup(mut self) -> Self {
        self.startup = true;
        self
    }
}

/// Timings reported by a host after an extension activated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationTimes {
    pub code_loading_ms: u64,
    pub activate_call_ms: u64,
    pub activate_resolved_ms: u64,
    #[serde(default)]
    pub activation_event: String,
}

// ============================================================================
// Host notifications
// ============================================================================

/// How a host went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostExit {
    pub code: i32,
    pub signal: Option<i32>,
}

impl HostExit {
    pub fn clean() -> Self {
        Self {
            code: 0,
            signal: None,
        }
    }

    pub fn code(code: i32) -> Self {
        Self { code, signal: None }
    }

    /// Non-zero code or killed by a signal.
    pub fn is_crash(&self) -> bool {
        self.code != 0 || self.signal.is_some()
    }
}

/// Asynchronous report from a host to its manager.
#[derive(Debug, Clone, PartialEq)]
pub enum HostNotification {
    WillActivateExtension(ExtensionIdentifier),
    DidActivateExtension {
        extension_id: ExtensionIdentifier,
        times: ActivationTimes,
    },
    ActivationFailed {
        extension_id: ExtensionIdentifier,
        message: String,
    },
    RuntimeError {
        extension_id: ExtensionIdentifier,
        message: String,
    },
    ResponsiveStateChanged(bool),
    Exited(HostExit),
}

/// Sender a host uses for its notifications.
pub type NotificationSender = mpsc::UnboundedSender<HostNotification>;

// ============================================================================
// Host contract
// ============================================================================

/// Everything a host needs when it starts.
#[derive(Debug, Clone)]
pub struct HostInit {
    /// Every registered extension, so dependencies across hosts resolve.
    pub all_extensions: Vec<Arc<ExtensionDescription>>,
    /// Extensions this host is responsible for.
    pub my_extensions: Vec<ExtensionIdentifier>,
    pub notifications: NotificationSender,
}

/// Extensions entering and leaving one host.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHostDelta {
    pub to_add: Vec<Arc<ExtensionDescription>>,
    pub to_remove: Vec<ExtensionIdentifier>,
}

impl ExtensionHostDelta {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// A runtime that loads extension code.
///
/// Activation must be idempotent on the host side: the orchestrator forwards
/// every request and never deduplicates. An extension whose activation
/// throws is reported with [`HostNotification::ActivationFailed`]; calls
/// return `Err` only when the request itself could not be served.
#[async_trait::async_trait]
pub trait ExtensionHost: Send + Sync {
    fn kind(&self) -> ExtensionHostKind;

    fn startup(&self) -> HostStartup {
        HostStartup::Eager
    }

    /// Boot the runtime with its initial extension set.
    async fn start(&self, init: HostInit) -> Result<()>;

    /// Activate one extension. `Ok(false)` means this host does not run it.
    async fn activate(&self, extension_id: &ExtensionIdentifier, reason: &ActivationReason)
        -> Result<bool>;

    /// Activate every extension of this host interested in `event`.
    async fn activate_by_event(&self, event: &str, kind: ActivationKind) -> Result<()>;

    async fn delta_extensions(&self, delta: &ExtensionHostDelta) -> Result<()>;

    /// Stop the runtime. Pending calls fail with `HostTerminated`.
    async fn terminate(&self);
}

/// Shared host handle.
pub type DynExtensionHost = Arc<dyn ExtensionHost>;
