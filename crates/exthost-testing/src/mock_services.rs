//! In-memory scanner, enablement and workspace services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use exthost_core::prelude::*;
use parking_lot::Mutex;

/// Scanner backed by two lists: what was installed at startup, and what
/// `resolve` can find afterwards.
#[derive(Default)]
pub struct MockScanner {
    installed: Mutex<Vec<ExtensionDescription>>,
    resolvable: Mutex<HashMap<(String, bool), ExtensionDescription>>,
    failing: Mutex<HashSet<ExtensionIdentifier>>,
    scan_fails: AtomicBool,
    resolve_calls: AtomicUsize,
    resolve_delay: Mutex<Option<Duration>>,
}

impl MockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed at startup, and resolvable later.
    pub fn with_installed(self, descriptions: impl IntoIterator<Item = ExtensionDescription>) -> Self {
        for desc in descriptions {
            self.installed.lock().push(desc.clone());
            self.install(desc);
        }
        self
    }

    /// Make `desc` resolvable. Replaces an earlier copy on the same side.
    pub fn install(&self, desc: ExtensionDescription) {
        let key = (desc.identifier.key().to_string(), desc.is_remote());
        self.resolvable.lock().insert(key, desc);
    }

    pub fn uninstall(&self, handle: &ExtensionHandle) {
        let key = (
            handle.identifier.key().to_string(),
            handle.location.is_remote(),
        );
        self.resolvable.lock().remove(&key);
    }

    /// Resolving `extension_id` returns an error.
    pub fn fail_resolve(&self, extension_id: impl Into<ExtensionIdentifier>) {
        self.failing.lock().insert(extension_id.into());
    }

    pub fn fail_scan(&self) {
        self.scan_fails.store(true, Ordering::SeqCst);
    }

    /// Delay every `resolve` by `delay`.
    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.resolve_delay.lock() = Some(delay);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ExtensionScanner for MockScanner {
    async fn scan_installed(&self) -> Result<Vec<ExtensionDescription>> {
        if self.scan_fails.load(Ordering::SeqCst) {
            return Err(HostError::Other("scan failed".to_string()));
        }
        Ok(self.installed.lock().clone())
    }

    async fn resolve(&self, handle: &ExtensionHandle) -> Result<Option<ExtensionDescription>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.resolve_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(&handle.identifier) {
            return Err(HostError::Resolution(
                handle.identifier.clone(),
                "manifest unreadable".to_string(),
            ));
        }
        let key = (
            handle.identifier.key().to_string(),
            handle.location.is_remote(),
        );
        Ok(self.resolvable.lock().get(&key).cloned())
    }
}

/// Everything enabled unless disabled here.
#[derive(Default)]
pub struct MockEnablement {
    disabled: Mutex<HashSet<ExtensionIdentifier>>,
}

impl MockEnablement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable(&self, extension_id: impl Into<ExtensionIdentifier>) {
        self.disabled.lock().insert(extension_id.into());
    }

    pub fn enable(&self, extension_id: impl Into<ExtensionIdentifier>) {
        self.disabled.lock().remove(&extension_id.into());
    }
}

#[async_trait::async_trait]
impl EnablementService for MockEnablement {
    async fn is_enabled(&self, handle: &ExtensionHandle) -> bool {
        !self.disabled.lock().contains(&handle.identifier)
    }
}

/// Workspace that matches the `workspaceContains:` events registered here.
#[derive(Default)]
pub struct MockWorkspace {
    matches: Mutex<HashMap<ExtensionIdentifier, String>>,
    checks: Mutex<Vec<(ExtensionHostKind, ExtensionIdentifier)>>,
}

impl MockWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// `check_activate` answers `event` for `extension_id`.
    pub fn matches(&self, extension_id: impl Into<ExtensionIdentifier>, event: impl Into<String>) {
        self.matches.lock().insert(extension_id.into(), event.into());
    }

    pub fn checks(&self) -> usize {
        self.checks.lock().len()
    }

    /// Host and extension of every check, in call order.
    pub fn checked(&self) -> Vec<(ExtensionHostKind, ExtensionIdentifier)> {
        self.checks.lock().clone()
    }
}

#[async_trait::async_trait]
impl WorkspaceContains for MockWorkspace {
    async fn check_activate(
        &self,
        host: ExtensionHostKind,
        description: &ExtensionDescription,
    ) -> Option<String> {
        self.checks
            .lock()
            .push((host, description.identifier.clone()));
        if !description.has_workspace_contains() {
            return None;
        }
        self.matches.lock().get(&description.identifier).cloned()
    }
}
