//! Extension orchestrator.
//!
//! Composes the registry, the running location classifier and the live host
//! managers behind one API. Registry mutations are queued and drained one
//! batch at a time under the orchestrator lock; activation requests are
//! served concurrently with them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    AllEnabled, EmptyWorkspace, EnablementService, ExtensionHostFactory, ExtensionScanner,
    WorkspaceContains,
};
use crate::config::OrchestratorConfig;
use crate::description::{
    ExtensionDescription, ExtensionHandle, ExtensionIdentifier, RemovalTarget,
    ON_STARTUP_FINISHED, WILDCARD_ACTIVATION_EVENT, WORKSPACE_CONTAINS_PREFIX,
};
use crate::error::{HostError, Result};
use crate::events::{EventBus, EventBusReceiver, OrchestratorEvent, Severity};
use crate::host::manager::ManagerNotification;
use crate::host::{
    ActivationKind, ActivationReason, ActivationTimes, ExtensionHostDelta, ExtensionHostKind,
    ExtensionHostManager, HostExit, HostNotification, HostStartup, HostState,
};
use crate::registry::ExtensionDescriptionRegistry;
use crate::running_location::{ExtensionRunningLocation, RunningLocationClassifier};
use crate::sync::{Barrier, Lock};

/// One queued registry mutation.
#[derive(Debug, Clone, Default)]
pub struct DeltaQueueItem {
    pub to_add: Vec<ExtensionHandle>,
    pub to_remove: Vec<RemovalTarget>,
}

/// What a drained delta did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub added: Vec<ExtensionIdentifier>,
    pub removed: Vec<ExtensionIdentifier>,
    /// Candidates refused admission, with the reason.
    pub refused: Vec<(ExtensionIdentifier, String)>,
    /// Candidates the scanner could not resolve.
    pub unresolved: Vec<ExtensionIdentifier>,
    pub removed_due_to_looping: Vec<ExtensionIdentifier>,
    /// Removal targets kept because they are active in a host.
    pub kept_active: Vec<ExtensionIdentifier>,
}

impl DeltaOutcome {
    fn merge(&mut self, other: DeltaOutcome) {
        self.added.extend(other.added);
        self.removed.extend(other.removed);
        self.refused.extend(other.refused);
        self.unresolved.extend(other.unresolved);
        self.removed_due_to_looping
            .extend(other.removed_due_to_looping);
        self.kept_active.extend(other.kept_active);
    }

    pub fn is_empty(&self) -> bool {
        *self == DeltaOutcome::default()
    }
}

/// A message recorded against one extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionMessage {
    pub severity: Severity,
    pub message: String,
}

/// Per-extension status as seen by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionStatus {
    pub messages: Vec<ExtensionMessage>,
    pub activation_times: Option<ActivationTimes>,
    pub runtime_errors: Vec<String>,
    pub running_location: Option<ExtensionRunningLocation>,
    pub is_active: bool,
}

/// Snapshot of one live host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSummary {
    pub kind: ExtensionHostKind,
    pub instance_id: uuid::Uuid,
    pub state: HostState,
    pub is_responsive: bool,
    pub extensions: usize,
}

#[derive(Default)]
struct DeltaQueue {
    items: VecDeque<DeltaQueueItem>,
    draining: bool,
}

/// Status collected from host notifications, keyed by extension key.
#[derive(Default)]
struct StatusBook {
    activation_times: HashMap<String, ActivationTimes>,
    runtime_errors: HashMap<String, Vec<String>>,
    messages: HashMap<String, Vec<ExtensionMessage>>,
}

impl StatusBook {
    fn forget(&mut self, key: &str) {
        self.activation_times.remove(key);
        self.runtime_errors.remove(key);
    }
}

/// Builder for [`ExtensionOrchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    scanner: Arc<dyn ExtensionScanner>,
    host_factory: Arc<dyn ExtensionHostFactory>,
    enablement: Arc<dyn EnablementService>,
    workspace: Arc<dyn WorkspaceContains>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn enablement(mut self, enablement: Arc<dyn EnablementService>) -> Self {
        self.enablement = enablement;
        self
    }

    pub fn workspace(mut self, workspace: Arc<dyn WorkspaceContains>) -> Self {
        self.workspace = workspace;
        self
    }

    /// Build the orchestrator. Must be called inside a tokio runtime.
    pub fn build(self) -> ExtensionOrchestrator {
        let classifier = RunningLocationClassifier::new(
            self.config.has_remote_host,
            self.config.has_web_worker_host,
        )
        .with_development_kind(self.config.development_kind.clone());

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            lock: Lock::with_warn_threshold(self.config.lock_warn_threshold),
            events: EventBus::with_capacity(self.config.event_capacity),
            config: self.config,
            registry: ExtensionDescriptionRegistry::new(),
            classifier,
            barrier: Barrier::new(),
            scanner: self.scanner,
            host_factory: self.host_factory,
            enablement: self.enablement,
            workspace: self.workspace,
            managers: RwLock::new(Vec::new()),
            running_locations: RwLock::new(HashMap::new()),
            requested_events: RwLock::new(Vec::new()),
            delta_queue: Mutex::new(DeltaQueue::default()),
            status: RwLock::new(StatusBook::default()),
            initialized: AtomicBool::new(false),
            notify_tx,
        });

        tokio::spawn(notification_loop(Arc::downgrade(&inner), notify_rx));
        ExtensionOrchestrator { inner }
    }
}

async fn notification_loop(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<ManagerNotification>,
) {
    while let Some(notification) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_notification(notification).await;
    }
    debug!("Host notification loop stopped");
}

/// Public entry point for hosting extensions.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct ExtensionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    registry: ExtensionDescriptionRegistry,
    classifier: RunningLocationClassifier,
    lock: Lock,
    barrier: Barrier,
    events: EventBus,
    scanner: Arc<dyn ExtensionScanner>,
    host_factory: Arc<dyn ExtensionHostFactory>,
    enablement: Arc<dyn EnablementService>,
    workspace: Arc<dyn WorkspaceContains>,
    managers: RwLock<Vec<Arc<ExtensionHostManager>>>,
    running_locations: RwLock<HashMap<String, ExtensionRunningLocation>>,
    /// Every activation event ever requested, in request order.
    requested_events: RwLock<Vec<String>>,
    delta_queue: Mutex<DeltaQueue>,
    status: RwLock<StatusBook>,
    initialized: AtomicBool,
    notify_tx: mpsc::UnboundedSender<ManagerNotification>,
}

/// Clears the draining flag if a drain is abandoned midway.
struct DrainReset<'a> {
    queue: &'a Mutex<DeltaQueue>,
    armed: bool,
}

impl Drop for DrainReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().draining = false;
        }
    }
}

impl ExtensionOrchestrator {
    pub fn builder(
        scanner: Arc<dyn ExtensionScanner>,
        host_factory: Arc<dyn ExtensionHostFactory>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: OrchestratorConfig::default(),
            scanner,
            host_factory,
            enablement: Arc::new(AllEnabled),
            workspace: Arc::new(EmptyWorkspace),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ExtensionDescriptionRegistry {
        &self.inner.registry
    }

    pub fn classifier(&self) -> &RunningLocationClassifier {
        &self.inner.classifier
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> EventBusReceiver {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------------

    /// Scan installed extensions, register them, start the hosts and open
    /// the installed-extensions barrier.
    ///
    /// The barrier opens even when the scan fails, so waiters never hang.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.initialized.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already initialized");
            return Ok(());
        }

        let mut guard = inner.lock.acquire("initialize").await;
        let scanned = match inner.scanner.scan_installed().await {
            Ok(scanned) => Ok(scanned),
            Err(e) => {
                error!(error = %e, "Scanning installed extensions failed");
                inner.notify(Severity::Error, format!("Failed to scan extensions: {e}"));
                Err(e)
            }
        };

        if let Ok(scanned) = &scanned {
            inner.register_initial(scanned.clone()).await;
        }
        inner.start_hosts(true).await;
        guard.release();

        inner.barrier.open();
        let all: Vec<ExtensionIdentifier> = inner
            .registry
            .get_all_extension_descriptions()
            .iter()
            .map(|desc| desc.identifier.clone())
            .collect();
        info!(extensions = all.len(), "Installed extensions registered");
        inner.events.publish(OrchestratorEvent::DidRegisterExtensions);
        inner
            .events
            .publish(OrchestratorEvent::DidChangeExtensionsStatus { extension_ids: all });

        scanned.map(|_| ())
    }

    /// Resolves once the installed extensions are registered.
    pub async fn when_installed_extensions_registered(&self) -> bool {
        self.inner.barrier.wait().await;
        true
    }

    // ------------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------------

    /// Activate every extension interested in `event`, in every host.
    ///
    /// The event is remembered and replayed into hosts started later and into
    /// extensions added later. Returns the first host failure.
    pub async fn activate_by_event(&self, event: &str, kind: ActivationKind) -> Result<()> {
        let inner = &self.inner;
        inner.record_requested_event(event);

        if inner.barrier.is_open() {
            if !inner.registry.contains_activation_event(event) {
                debug!(event, "No extension interested in activation event");
                return Ok(());
            }
            return inner.dispatch_activation_event(event, kind).await;
        }

        if kind == ActivationKind::Immediate {
            return inner.dispatch_activation_event(event, kind).await;
        }
        inner.barrier.wait().await;
        inner.dispatch_activation_event(event, kind).await
    }

    /// Activate one extension in whichever host runs it.
    pub async fn activate_by_id(
        &self,
        extension_id: &ExtensionIdentifier,
        reason: ActivationReason,
    ) -> Result<()> {
        let managers = self.inner.live_managers();
        let results = join_all(
            managers
                .iter()
                .map(|manager| manager.activate(extension_id, &reason)),
        )
        .await;

        let mut activated = false;
        let mut first_error = None;
        for (manager, result) in managers.iter().zip(results) {
            match result {
                Ok(found) => activated |= found,
                Err(e) => {
                    warn!(extension_id = %extension_id, kind = %manager.kind(), error = %e, "Activating extension failed");
                    self.inner.record_runtime_error(extension_id, e.to_string());
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if !activated {
            return Err(HostError::UnknownExtension(extension_id.clone()));
        }
        Ok(())
    }

    /// Active or activating in any live host.
    pub fn is_extension_active(&self, extension_id: &ExtensionIdentifier) -> bool {
        self.inner.is_extension_active(extension_id)
    }

    /// Activation events requested so far, in request order.
    pub fn requested_activation_events(&self) -> Vec<String> {
        self.inner.requested_events.read().clone()
    }

    // ------------------------------------------------------------------------
    // Deltas
    // ------------------------------------------------------------------------

    /// Queue a registry mutation.
    ///
    /// When no drain is running this call drains the queue under the lock
    /// and returns the combined outcome. Otherwise it returns an empty
    /// outcome as soon as the item is queued; the running drain applies it.
    pub async fn request_delta(
        &self,
        to_add: Vec<ExtensionHandle>,
        to_remove: Vec<RemovalTarget>,
    ) -> DeltaOutcome {
        self.inner
            .handle_delta(DeltaQueueItem { to_add, to_remove })
            .await
    }

    /// Installer callback: extensions were enabled or disabled.
    pub async fn on_enablement_changed(&self, handles: Vec<ExtensionHandle>) -> DeltaOutcome {
        let mut to_add = Vec::new();
        let mut to_remove = Vec::new();
        for handle in handles {
            if self.inner.enablement.is_enabled(&handle).await {
                to_add.push(handle);
            } else {
                to_remove.push(RemovalTarget::Handle(handle));
            }
        }
        self.request_delta(to_add, to_remove).await
    }

    /// Installer callback: an extension was installed.
    pub async fn on_installed(&self, handle: ExtensionHandle) -> DeltaOutcome {
        if !self.inner.enablement.is_enabled(&handle).await {
            debug!(extension_id = %handle.identifier, "Installed extension is disabled");
            return DeltaOutcome::default();
        }
        self.request_delta(vec![handle], Vec::new()).await
    }

    /// Installer callback: an extension was uninstalled.
    pub async fn on_uninstalled(&self, extension_id: ExtensionIdentifier) -> DeltaOutcome {
        self.request_delta(Vec::new(), vec![RemovalTarget::Id(extension_id)])
            .await
    }

    /// Whether `description` would be admitted by the next delta.
    pub fn can_add_extension(&self, description: &ExtensionDescription) -> bool {
        self.inner.check_can_add(description, &[]).is_ok()
    }

    /// Whether the registered copy of `description` may be removed.
    pub fn can_remove_extension(&self, description: &ExtensionDescription) -> bool {
        self.inner.can_remove_extension(&description.identifier)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn get_extensions(&self) -> Vec<Arc<ExtensionDescription>> {
        self.inner.barrier.wait().await;
        self.inner.registry.get_all_extension_descriptions()
    }

    pub async fn get_extension(
        &self,
        extension_id: &ExtensionIdentifier,
    ) -> Option<Arc<ExtensionDescription>> {
        self.inner.barrier.wait().await;
        self.inner.registry.get_extension_description(extension_id)
    }

    pub fn get_running_location(
        &self,
        extension_id: &ExtensionIdentifier,
    ) -> Option<ExtensionRunningLocation> {
        self.inner
            .running_locations
            .read()
            .get(extension_id.key())
            .copied()
    }

    /// Status of every registered extension, keyed by display id.
    pub fn get_extensions_status(&self) -> BTreeMap<String, ExtensionStatus> {
        let inner = &self.inner;
        let locations = inner.running_locations.read();
        let status = inner.status.read();
        inner
            .registry
            .get_all_extension_descriptions()
            .iter()
            .map(|desc| {
                let key = desc.identifier.key();
                let entry = ExtensionStatus {
                    messages: status.messages.get(key).cloned().unwrap_or_default(),
                    activation_times: status.activation_times.get(key).cloned(),
                    runtime_errors: status.runtime_errors.get(key).cloned().unwrap_or_default(),
                    running_location: locations.get(key).copied(),
                    is_active: inner.is_extension_active(&desc.identifier),
                };
                (desc.identifier.value().to_string(), entry)
            })
            .collect()
    }

    pub fn live_hosts(&self) -> Vec<HostSummary> {
        self.inner
            .live_managers()
            .iter()
            .map(|manager| HostSummary {
                kind: manager.kind(),
                instance_id: manager.instance_id(),
                state: manager.state(),
                is_responsive: manager.is_responsive(),
                extensions: manager.members().len(),
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Host lifecycle
    // ------------------------------------------------------------------------

    /// Terminate every host. In-flight calls fail with `HostTerminated`.
    pub async fn stop_extension_hosts(&self) {
        self.inner.stop_hosts().await;
    }

    /// Stop whatever runs, then start a fresh set of hosts and replay every
    /// requested activation event into them.
    pub async fn start_extension_hosts(&self) {
        let inner = &self.inner;
        inner.stop_hosts().await;
        let _guard = inner.lock.acquire("startExtensionHosts").await;
        inner.start_hosts(false).await;
    }

    pub async fn restart_extension_host(&self) {
        info!("Restarting extension hosts");
        self.start_extension_hosts().await;
    }
}

impl Inner {
    fn live_managers(&self) -> Vec<Arc<ExtensionHostManager>> {
        self.managers.read().clone()
    }

    fn manager_for(&self, kind: ExtensionHostKind) -> Option<Arc<ExtensionHostManager>> {
        self.managers
            .read()
            .iter()
            .find(|manager| manager.kind() == kind)
            .cloned()
    }

    fn is_extension_active(&self, extension_id: &ExtensionIdentifier) -> bool {
        self.managers
            .read()
            .iter()
            .any(|manager| manager.is_extension_active(extension_id))
    }

    fn notify(&self, severity: Severity, message: String) {
        self.events
            .publish(OrchestratorEvent::Notification { severity, message });
    }

    /// Record a failure against an extension's status, if it is registered.
    fn record_runtime_error(&self, extension_id: &ExtensionIdentifier, message: String) {
        if !self.registry.contains_extension(extension_id) {
            return;
        }
        self.status
            .write()
            .runtime_errors
            .entry(extension_id.key().to_string())
            .or_default()
            .push(message);
        self.events.publish(OrchestratorEvent::DidChangeExtensionsStatus {
            extension_ids: vec![extension_id.clone()],
        });
    }

    fn record_requested_event(&self, event: &str) {
        let mut requested = self.requested_events.write();
        if !requested.iter().any(|e| e == event) {
            requested.push(event.to_string());
        }
    }

    async fn dispatch_activation_event(&self, event: &str, kind: ActivationKind) -> Result<()> {
        self.events.publish(OrchestratorEvent::WillActivateByEvent {
            event: event.to_string(),
        });
        let managers = self.live_managers();
        let results = join_all(
            managers
                .iter()
                .map(|manager| manager.activate_by_event(event, kind)),
        )
        .await;

        let mut first_error = None;
        for (manager, result) in managers.iter().zip(results) {
            if let Err(e) = result {
                warn!(kind = %manager.kind(), event, error = %e, "Activation event failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register the initial scan: enabled extensions only, each copy placed
    /// by the classifier, the copy on the chosen side kept.
    async fn register_initial(&self, scanned: Vec<ExtensionDescription>) {
        let mut enabled = Vec::with_capacity(scanned.len());
        for desc in scanned {
            if desc.is_under_development || self.enablement.is_enabled(&desc.handle()).await {
                enabled.push(desc);
            } else {
                debug!(extension_id = %desc.identifier, "Skipping disabled extension");
            }
        }

        let (remote, local): (Vec<_>, Vec<_>) =
            enabled.into_iter().partition(|desc| desc.is_remote());
        let locations = self.classifier.determine_running_location(&local, &remote);

        let mut to_register: Vec<Arc<ExtensionDescription>> = Vec::new();
        let mut chosen: HashMap<String, ExtensionRunningLocation> = HashMap::new();
        for desc in local.into_iter().chain(remote) {
            let key = desc.identifier.key().to_string();
            let location = locations
                .get(&key)
                .copied()
                .unwrap_or(ExtensionRunningLocation::None);
            if location == ExtensionRunningLocation::None {
                warn!(extension_id = %desc.identifier, "Extension cannot run in any host");
                continue;
            }
            let wants_remote = location == ExtensionRunningLocation::Remote;
            if desc.is_remote() != wants_remote {
                debug!(extension_id = %desc.identifier, location = %location, "Skipping copy on the other side");
                continue;
            }
            chosen.insert(key, location);
            to_register.push(Arc::new(desc));
        }

        let result = self.registry.delta_extensions(to_register, &[]);
        self.report_looping(&result.removed_due_to_looping);

        let mut running = self.running_locations.write();
        for desc in self.registry.get_all_extension_descriptions() {
            if let Some(location) = chosen.get(desc.identifier.key()) {
                running.insert(desc.identifier.key().to_string(), *location);
            }
        }
    }

    fn report_looping(&self, looping: &[Arc<ExtensionDescription>]) {
        if looping.is_empty() {
            return;
        }
        let names: Vec<String> = looping
            .iter()
            .map(|desc| format!("'{}'", desc.identifier))
            .collect();
        let message = format!(
            "The following extensions contain dependency loops and have been disabled: {}",
            names.join(", ")
        );
        error!(extensions = %names.join(", "), "Dependency loop detected");
        self.notify(Severity::Error, message);
    }

    /// Admission check against the registry and the batch built so far.
    fn check_can_add(
        &self,
        description: &ExtensionDescription,
        pending: &[Arc<ExtensionDescription>],
    ) -> std::result::Result<(), String> {
        let id = &description.identifier;
        if self.registry.contains_extension(id) || pending.iter().any(|d| &d.identifier == id) {
            return Err("already registered".to_string());
        }
        if let Some(uuid) = description.uuid {
            let clash = self
                .registry
                .get_all_extension_descriptions()
                .iter()
                .chain(pending)
                .any(|d| d.uuid == Some(uuid));
            if clash {
                return Err(format!("uuid {uuid} already registered"));
            }
        }
        if self.classifier.classify(description) == ExtensionRunningLocation::None {
            return Err("no host can run it".to_string());
        }
        Ok(())
    }

    fn can_remove_extension(&self, extension_id: &ExtensionIdentifier) -> bool {
        self.registry.contains_extension(extension_id) && !self.is_extension_active(extension_id)
    }

    async fn handle_delta(self: &Arc<Self>, item: DeltaQueueItem) -> DeltaOutcome {
        {
            let mut queue = self.delta_queue.lock();
            queue.items.push_back(item);
            if queue.draining {
                return DeltaOutcome::default();
            }
            queue.draining = true;
        }
        let mut reset = DrainReset {
            queue: &self.delta_queue,
            armed: true,
        };

        let mut guard = self.lock.acquire("handleDeltaExtensions").await;
        let mut outcome = DeltaOutcome::default();
        loop {
            let next = {
                let mut queue = self.delta_queue.lock();
                let next = queue.items.pop_front();
                if next.is_none() {
                    queue.draining = false;
                }
                next
            };
            let Some(item) = next else {
                break;
            };
            outcome.merge(self.delta_extensions(item).await);
        }
        reset.armed = false;
        guard.release();
        outcome
    }

    async fn delta_extensions(self: &Arc<Self>, item: DeltaQueueItem) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();

        let mut to_add: Vec<Arc<ExtensionDescription>> = Vec::new();
        for handle in item.to_add {
            let desc = match self.scanner.resolve(&handle).await {
                Ok(Some(desc)) => desc,
                Ok(None) => {
                    warn!(extension_id = %handle.identifier, "Could not resolve extension, dropping it");
                    outcome.unresolved.push(handle.identifier);
                    continue;
                }
                Err(e) => {
                    warn!(extension_id = %handle.identifier, error = %e, "Resolving extension failed, dropping it");
                    outcome.unresolved.push(handle.identifier);
                    continue;
                }
            };
            if let Err(reason) = self.check_can_add(&desc, &to_add) {
                info!(extension_id = %desc.identifier, reason = %reason, "Extension not added");
                outcome.refused.push((desc.identifier.clone(), reason));
                continue;
            }
            to_add.push(Arc::new(desc));
        }

        let mut to_remove: Vec<Arc<ExtensionDescription>> = Vec::new();
        for target in item.to_remove {
            let Some(existing) = self.registry.get_extension_description(target.identifier())
            else {
                debug!(extension_id = %target.identifier(), "Ignoring removal of unregistered extension");
                continue;
            };
            if !target.matches_location(&existing) {
                debug!(extension_id = %existing.identifier, "Removal concerns the copy on the other side");
                continue;
            }
            if to_remove.iter().any(|d| d.identifier == existing.identifier) {
                continue;
            }
            if !self.can_remove_extension(&existing.identifier) {
                info!(extension_id = %existing.identifier, "Extension is active, keeping it");
                outcome.kept_active.push(existing.identifier.clone());
                continue;
            }
            to_remove.push(existing);
        }

        if to_add.is_empty() && to_remove.is_empty() {
            return outcome;
        }

        let remove_ids: Vec<ExtensionIdentifier> =
            to_remove.iter().map(|d| d.identifier.clone()).collect();
        let result = self.registry.delta_extensions(to_add.clone(), &remove_ids);

        let looping = result.removed_due_to_looping;
        let is_looping = |id: &ExtensionIdentifier| looping.iter().any(|d| &d.identifier == id);
        let candidate_ids: Vec<ExtensionIdentifier> =
            to_add.iter().map(|d| d.identifier.clone()).collect();
        let added: Vec<Arc<ExtensionDescription>> = to_add
            .into_iter()
            .filter(|d| !is_looping(&d.identifier))
            .collect();
        // Already registered extensions pulled into a loop leave their host too.
        let mut host_removals = remove_ids.clone();
        for desc in &looping {
            if !candidate_ids.contains(&desc.identifier) {
                host_removals.push(desc.identifier.clone());
            }
        }

        outcome.added = added.iter().map(|d| d.identifier.clone()).collect();
        outcome.removed = remove_ids;
        outcome.removed_due_to_looping = looping.iter().map(|d| d.identifier.clone()).collect();

        self.events.publish(OrchestratorEvent::DidChangeExtensions {
            added: outcome.added.clone(),
            removed: host_removals.clone(),
        });
        self.report_looping(&looping);

        self.update_hosts(&added, &host_removals).await;

        for desc in added {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.activate_added_extension_if_needed(desc).await;
            });
        }
        outcome
    }

    /// Reassign running locations and send each host its share of the delta.
    async fn update_hosts(
        &self,
        added: &[Arc<ExtensionDescription>],
        removed: &[ExtensionIdentifier],
    ) {
        let mut deltas: HashMap<ExtensionHostKind, ExtensionHostDelta> = HashMap::new();
        {
            let mut locations = self.running_locations.write();
            let mut status = self.status.write();
            for id in removed {
                if let Some(kind) = locations
                    .remove(id.key())
                    .and_then(|location| location.host_kind())
                {
                    deltas.entry(kind).or_default().to_remove.push(id.clone());
                }
                status.forget(id.key());
            }
            for desc in added {
                let location = self.classifier.classify(desc);
                locations.insert(desc.identifier.key().to_string(), location);
                if let Some(kind) = location.host_kind() {
                    deltas.entry(kind).or_default().to_add.push(desc.clone());
                }
            }
        }

        let all = self.registry.get_all_extension_descriptions();
        let mut calls = Vec::new();
        for kind in ExtensionHostKind::ALL {
            let Some(delta) = deltas.remove(&kind) else {
                continue;
            };
            if delta.is_empty() {
                continue;
            }
            let Some(manager) = self.manager_for(kind) else {
                debug!(kind = %kind, "No live host for delta");
                continue;
            };
            let all = all.clone();
            calls.push(async move {
                let result = if manager.is_deferred() && !delta.to_add.is_empty() {
                    manager.start_deferred(all, &delta).await
                } else {
                    manager.delta_extensions(&delta).await
                };
                (manager, result)
            });
        }
        // Siblings still get their share when one host fails.
        for (manager, result) in join_all(calls).await {
            let Err(e) = result else {
                continue;
            };
            error!(kind = %manager.kind(), error = %e, "Updating extensions on host failed");
            if manager.state() == HostState::Crashed {
                self.managers
                    .write()
                    .retain(|m| m.instance_id() != manager.instance_id());
                self.notify(Severity::Error, e.to_string());
            }
        }
    }

    /// Replay activation for an extension that was just added.
    async fn activate_added_extension_if_needed(&self, desc: Arc<ExtensionDescription>) {
        let mut reason_event = None;
        let mut has_workspace_contains = false;
        {
            let requested = self.requested_events.read();
            for event in desc.effective_activation_events() {
                if requested.iter().any(|r| r == &event)
                    || event == WILDCARD_ACTIVATION_EVENT
                    || event == ON_STARTUP_FINISHED
                {
                    reason_event = Some(event);
                    break;
                }
                if event.starts_with(WORKSPACE_CONTAINS_PREFIX) {
                    has_workspace_contains = true;
                }
            }
        }

        if reason_event.is_none() && has_workspace_contains {
            let host = self
                .running_locations
                .read()
                .get(desc.identifier.key())
                .and_then(|location| location.host_kind());
            if let Some(host) = host {
                reason_event = self.workspace.check_activate(host, &desc).await;
            }
        }
        let Some(event) = reason_event else {
            return;
        };

        debug!(extension_id = %desc.identifier, event = %event, "Activating added extension");
        let reason = ActivationReason::new(desc.identifier.clone(), event);
        let managers = self.live_managers();
        let results = join_all(
            managers
                .iter()
                .map(|manager| manager.activate(&desc.identifier, &reason)),
        )
        .await;
        for result in results {
            if let Err(e) = result {
                warn!(extension_id = %desc.identifier, error = %e, "Activating added extension failed");
                self.record_runtime_error(&desc.identifier, e.to_string());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Hosts
    // ------------------------------------------------------------------------

    /// Create a manager per host and start the eager ones, plus lazy ones
    /// that already have extensions. Lazy hosts without any stay deferred.
    async fn start_hosts(&self, is_initial_start: bool) {
        let hosts = self.host_factory.create_hosts(is_initial_start).await;
        let all = self.registry.get_all_extension_descriptions();
        let locations = self.running_locations.read().clone();

        let mut deferred = Vec::new();
        let mut starting = Vec::new();
        for host in hosts {
            let manager = Arc::new(ExtensionHostManager::new(host));
            let kind = manager.kind();
            let mine: Vec<ExtensionIdentifier> = all
                .iter()
                .filter(|desc| {
                    locations
                        .get(desc.identifier.key())
                        .and_then(|location| location.host_kind())
                        == Some(kind)
                })
                .map(|desc| desc.identifier.clone())
                .collect();
            if mine.is_empty() && manager.startup() == HostStartup::Lazy {
                manager.defer(self.notify_tx.clone());
                deferred.push(manager);
            } else {
                starting.push((manager, mine));
            }
        }

        // Events requested from here on reach the published managers; earlier
        // ones are replayed at start.
        let initial_events = {
            let mut managers = self.managers.write();
            managers.extend(deferred);
            managers.extend(starting.iter().map(|(manager, _)| manager.clone()));
            self.requested_events.read().clone()
        };

        let starts = starting.into_iter().map(|(manager, mine)| {
            let all = all.clone();
            let notify = self.notify_tx.clone();
            let events = initial_events.clone();
            async move {
                let result = manager.start(all, mine, notify, events).await;
                (manager, result)
            }
        });
        for (manager, result) in join_all(starts).await {
            if let Err(e) = result {
                self.managers
                    .write()
                    .retain(|m| m.instance_id() != manager.instance_id());
                self.notify(Severity::Error, e.to_string());
            }
        }
    }

    async fn stop_hosts(&self) {
        let managers: Vec<Arc<ExtensionHostManager>> = std::mem::take(&mut *self.managers.write());
        if managers.is_empty() {
            return;
        }
        let previously_active: Vec<ExtensionIdentifier> = managers
            .iter()
            .flat_map(|manager| manager.active_extensions())
            .collect();

        join_all(managers.iter().map(|manager| manager.terminate())).await;
        {
            let mut status = self.status.write();
            status.activation_times.clear();
            status.runtime_errors.clear();
        }
        info!(hosts = managers.len(), "Extension hosts stopped");

        if !previously_active.is_empty() {
            self.events.publish(OrchestratorEvent::DidChangeExtensionsStatus {
                extension_ids: previously_active,
            });
        }
    }

    async fn handle_notification(&self, tagged: ManagerNotification) {
        let Some(manager) = self
            .managers
            .read()
            .iter()
            .find(|m| m.instance_id() == tagged.instance_id)
            .cloned()
        else {
            debug!(kind = %tagged.kind, instance_id = %tagged.instance_id, "Ignoring notification from stale host");
            return;
        };

        match tagged.notification {
            HostNotification::WillActivateExtension(id) => {
                debug!(extension_id = %id, kind = %tagged.kind, "Extension activating");
            }
            HostNotification::DidActivateExtension {
                extension_id,
                times,
            } => {
                self.status
                    .write()
                    .activation_times
                    .insert(extension_id.key().to_string(), times);
                self.events.publish(OrchestratorEvent::DidChangeExtensionsStatus {
                    extension_ids: vec![extension_id],
                });
            }
            HostNotification::ActivationFailed {
                extension_id,
                message,
            } => {
                error!(extension_id = %extension_id, error = %message, "Extension activation failed");
                {
                    let mut status = self.status.write();
                    let key = extension_id.key().to_string();
                    status
                        .messages
                        .entry(key.clone())
                        .or_default()
                        .push(ExtensionMessage {
                            severity: Severity::Error,
                            message: format!("Activating extension failed: {message}"),
                        });
                    status.runtime_errors.entry(key).or_default().push(message);
                }
                self.events.publish(OrchestratorEvent::DidChangeExtensionsStatus {
                    extension_ids: vec![extension_id],
                });
            }
            HostNotification::RuntimeError {
                extension_id,
                message,
            } => {
                warn!(extension_id = %extension_id, error = %message, "Extension runtime error");
                self.status
                    .write()
                    .runtime_errors
                    .entry(extension_id.key().to_string())
                    .or_default()
                    .push(message);
                self.events.publish(OrchestratorEvent::DidChangeExtensionsStatus {
                    extension_ids: vec![extension_id],
                });
            }
            HostNotification::ResponsiveStateChanged(is_responsive) => {
                self.events.publish(OrchestratorEvent::DidChangeResponsiveState {
                    kind: tagged.kind,
                    is_responsive,
                });
            }
            HostNotification::Exited(exit) => self.on_host_exit(&manager, exit),
        }
    }

    /// A live host went away without being asked to.
    ///
    /// Only the exited manager is dropped; the others keep running.
    fn on_host_exit(&self, manager: &Arc<ExtensionHostManager>, exit: HostExit) {
        self.managers
            .write()
            .retain(|m| m.instance_id() != manager.instance_id());
        let affected = manager.clear_membership();
        {
            let mut status = self.status.write();
            for id in &affected {
                status.forget(id.key());
            }
        }

        if self.config.is_dev_host {
            info!(kind = %manager.kind(), code = exit.code, "Extension development host exited");
            self.notify(
                Severity::Info,
                format!("Extension host exited with code {}", exit.code),
            );
            self.events
                .publish(OrchestratorEvent::HostExitRequested { code: exit.code });
        } else {
            error!(
                kind = %manager.kind(),
                code = exit.code,
                signal = ?exit.signal,
                "Extension host terminated unexpectedly"
            );
            self.notify(
                Severity::Error,
                format!(
                    "Extension host ({}) terminated unexpectedly. Code: {}, Signal: {:?}",
                    manager.kind(),
                    exit.code,
                    exit.signal
                ),
            );
        }

        if !affected.is_empty() {
            self.events.publish(OrchestratorEvent::DidChangeExtensionsStatus {
                extension_ids: affected,
            });
        }
    }
}

