//! Services the orchestrator consumes but does not implement.

use crate::description::{ExtensionDescription, ExtensionHandle};
use crate::error::Result;
use crate::host::{DynExtensionHost, ExtensionHostKind};

/// Reads installed extensions and resolves install handles to descriptions.
#[async_trait::async_trait]
pub trait ExtensionScanner: Send + Sync {
    /// Every installed extension, local and remote.
    async fn scan_installed(&self) -> Result<Vec<ExtensionDescription>>;

    /// Resolve one handle. `Ok(None)` means it no longer exists.
    async fn resolve(&self, handle: &ExtensionHandle) -> Result<Option<ExtensionDescription>>;
}

/// Tells whether an installed extension is enabled.
#[async_trait::async_trait]
pub trait EnablementService: Send + Sync {
    async fn is_enabled(&self, handle: &ExtensionHandle) -> bool;
}

/// Every extension is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllEnabled;

#[async_trait::async_trait]
impl EnablementService for AllEnabled {
    async fn is_enabled(&self, _handle: &ExtensionHandle) -> bool {
        true
    }
}

/// Answers `workspaceContains:` activation events.
#[async_trait::async_trait]
pub trait WorkspaceContains: Send + Sync {
    /// The activation event to fire for `description`, if the workspace as
    /// seen from `host` matches one of its `workspaceContains:` patterns.
    async fn check_activate(
        &self,
        host: ExtensionHostKind,
        description: &ExtensionDescription,
    ) -> Option<String>;
}

/// A workspace that never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyWorkspace;

#[async_trait::async_trait]
impl WorkspaceContains for EmptyWorkspace {
    async fn check_activate(
        &self,
        _host: ExtensionHostKind,
        _description: &ExtensionDescription,
    ) -> Option<String> {
        None
    }
}

/// Creates the hosts of one start cycle.
#[async_trait::async_trait]
pub trait ExtensionHostFactory: Send + Sync {
    /// `is_initial_start` is false when hosts are recreated by a restart.
    async fn create_hosts(&self, is_initial_start: bool) -> Vec<DynExtensionHost>;
}
