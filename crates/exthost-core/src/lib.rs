//! Core types and services for hosting extensions.
//!
//! This crate owns the extension registry, running location classification,
//! host lifecycle management and the orchestrator that ties them together.

pub mod collaborators;
pub mod config;
pub mod description;
pub mod error;
pub mod events;
pub mod host;
pub mod orchestrator;
pub mod registry;
pub mod running_location;
pub mod sync;

pub use description::{
    ExtensionDescription, ExtensionHandle, ExtensionIdentifier, ExtensionKind, ExtensionLocation,
    RemovalTarget,
};
pub use error::{HostError, Result};

// Event exports
pub use events::{EventBus, EventBusReceiver, EventMetadata, OrchestratorEvent, Severity};

// Host exports
pub use host::{
    ActivationKind, ActivationReason, ActivationTimes, DynExtensionHost, ExtensionHost,
    ExtensionHostDelta, ExtensionHostKind, ExtensionHostManager, HostExit, HostInit,
    HostNotification, HostStartup, HostState, ProcessExtensionHost, ProcessHostFactory,
};

pub use orchestrator::{
    DeltaOutcome, ExtensionMessage, ExtensionOrchestrator, ExtensionStatus, HostSummary,
    OrchestratorBuilder,
};
pub use registry::{DeltaResult, ExtensionDescriptionRegistry};
pub use running_location::{
    ExtensionRunningLocation, ExtensionRunningPreference, RunningLocationClassifier,
};

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{defaults, env_vars, HostCommand, OrchestratorConfig};

    // Error handling
    pub use crate::error::{HostError, Result};

    // Descriptions
    pub use crate::description::{
        ExtensionDescription, ExtensionHandle, ExtensionIdentifier, ExtensionKind,
        ExtensionLocation, RemovalTarget,
    };

    // Collaborators
    pub use crate::collaborators::{
        AllEnabled, EmptyWorkspace, EnablementService, ExtensionHostFactory, ExtensionScanner,
        WorkspaceContains,
    };

    // Hosts
    pub use crate::host::{
        ActivationKind, ActivationReason, DynExtensionHost, ExtensionHost, ExtensionHostKind,
        HostNotification, HostStartup,
    };

    // Orchestration
    pub use crate::events::{EventBus, OrchestratorEvent, Severity};
    pub use crate::orchestrator::{DeltaOutcome, ExtensionOrchestrator};
    pub use crate::running_location::ExtensionRunningLocation;
}
