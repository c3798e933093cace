//! Lifecycle wrapper around one extension host.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    ActivationKind, ActivationReason, DynExtensionHost, ExtensionHostDelta, ExtensionHostKind,
    HostInit, HostNotification, HostStartup,
};
use crate::description::{ExtensionDescription, ExtensionIdentifier};
use crate::error::Result;
use crate::sync::Barrier;

/// Lifecycle state of a managed host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Lazy host parked until its first extension arrives.
    Deferred,
    Starting,
    Running,
    Exited,
    Crashed,
}

impl HostState {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Deferred | Self::Starting | Self::Running)
    }
}

/// A host notification tagged with the manager it came from.
#[derive(Debug, Clone)]
pub struct ManagerNotification {
    pub instance_id: Uuid,
    pub kind: ExtensionHostKind,
    pub notification: HostNotification,
}

/// Owns one live host runtime.
///
/// Each manager gets a fresh instance id; notifications carry it so the
/// orchestrator can drop reports from managers it already tore down.
pub struct ExtensionHostManager {
    instance_id: Uuid,
    kind: ExtensionHostKind,
    host: DynExtensionHost,
    startup: HostStartup,
    state: RwLock<HostState>,
    members: RwLock<HashSet<ExtensionIdentifier>>,
    active: RwLock<HashSet<ExtensionIdentifier>>,
    responsive: AtomicBool,
    /// Set once `start` has been called.
    started: AtomicBool,
    /// Notification sink kept for a deferred start.
    deferred: Mutex<Option<mpsc::UnboundedSender<ManagerNotification>>>,
    ready: Barrier,
}

impl ExtensionHostManager {
    pub fn new(host: DynExtensionHost) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            kind: host.kind(),
            startup: host.startup(),
            host,
            state: RwLock::new(HostState::Starting),
            members: RwLock::new(HashSet::new()),
            active: RwLock::new(HashSet::new()),
            responsive: AtomicBool::new(true),
            started: AtomicBool::new(false),
            deferred: Mutex::new(None),
            ready: Barrier::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn kind(&self) -> ExtensionHostKind {
        self.kind
    }

    pub fn startup(&self) -> HostStartup {
        self.startup
    }

    pub fn state(&self) -> HostState {
        *self.state.read()
    }

    /// Whether `start` has been called on this manager.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether `start` has finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.ready.is_open()
    }

    pub fn is_responsive(&self) -> bool {
        self.responsive.load(Ordering::Relaxed)
    }

    pub fn is_deferred(&self) -> bool {
        self.state() == HostState::Deferred
    }

    /// Park a lazy host instead of starting it.
    ///
    /// Calls made while deferred resolve without reaching the host, and
    /// deltas only update membership until [`start_deferred`] runs.
    ///
    /// [`start_deferred`]: Self::start_deferred
    pub fn defer(&self, notify: mpsc::UnboundedSender<ManagerNotification>) {
        info!(kind = %self.kind, "No extensions yet, deferring extension host start");
        *self.state.write() = HostState::Deferred;
        *self.deferred.lock() = Some(notify);
    }

    /// Start a deferred host with the members `delta` leaves it with.
    pub async fn start_deferred(
        self: &Arc<Self>,
        all_extensions: Vec<Arc<ExtensionDescription>>,
        delta: &ExtensionHostDelta,
    ) -> Result<()> {
        self.apply_membership(delta);
        let Some(notify) = self.deferred.lock().take() else {
            return self.delta_extensions(delta).await;
        };
        let members = self.members();
        info!(kind = %self.kind, extensions = members.len(), "First extension arrived, starting deferred host");
        self.start(all_extensions, members, notify, Vec::new()).await
    }

    /// Start the host with its initial extensions, then replay
    /// `initial_events` into it.
    ///
    /// Notifications from the host are forwarded to `notify` tagged with this
    /// manager's instance id.
    pub async fn start(
        self: &Arc<Self>,
        all_extensions: Vec<Arc<ExtensionDescription>>,
        my_extensions: Vec<ExtensionIdentifier>,
        notify: mpsc::UnboundedSender<ManagerNotification>,
        initial_events: Vec<String>,
    ) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.write();
            if *state == HostState::Deferred {
                *state = HostState::Starting;
            }
        }
        self.members.write().extend(my_extensions.iter().cloned());

        let (tx, mut rx) = mpsc::unbounded_channel::<HostNotification>();
        let weak = Arc::downgrade(self);
        let instance_id = self.instance_id;
        let kind = self.kind;
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let Some(manager) = weak.upgrade() {
                    manager.observe(&notification);
                }
                let tagged = ManagerNotification {
                    instance_id,
                    kind,
                    notification,
                };
                if notify.send(tagged).is_err() {
                    break;
                }
            }
        });

        info!(kind = %self.kind, extensions = my_extensions.len(), "Starting extension host");
        let init = HostInit {
            all_extensions,
            my_extensions,
            notifications: tx,
        };
        match self.host.start(init).await {
            Ok(()) => {
                {
                    let mut state = self.state.write();
                    if *state == HostState::Starting {
                        *state = HostState::Running;
                    }
                }
                self.ready.open();
                info!(kind = %self.kind, instance_id = %self.instance_id, "Extension host started");
            }
            Err(e) => {
                *self.state.write() = HostState::Crashed;
                self.ready.open();
                error!(kind = %self.kind, error = %e, "Extension host failed to start");
                return Err(e);
            }
        }

        let replays = initial_events
            .iter()
            .map(|event| self.activate_by_event(event, ActivationKind::Normal));
        for (event, result) in initial_events.iter().zip(join_all(replays).await) {
            if let Err(e) = result {
                warn!(kind = %self.kind, event = %event, error = %e, "Replaying activation event failed");
            }
        }
        Ok(())
    }

    /// Track activation and lifecycle reports before they are forwarded.
    fn observe(&self, notification: &HostNotification) {
        match notification {
            HostNotification::WillActivateExtension(id) => {
                self.active.write().insert(id.clone());
            }
            HostNotification::DidActivateExtension { extension_id, .. } => {
                self.active.write().insert(extension_id.clone());
            }
            HostNotification::ActivationFailed { extension_id, .. } => {
                self.active.write().remove(extension_id);
            }
            HostNotification::RuntimeError { .. } => {}
            HostNotification::ResponsiveStateChanged(responsive) => {
                self.responsive.store(*responsive, Ordering::Relaxed);
            }
            HostNotification::Exited(exit) => {
                let mut state = self.state.write();
                if state.is_alive() {
                    *state = if exit.is_crash() {
                        HostState::Crashed
                    } else {
                        HostState::Exited
                    };
                }
                drop(state);
                self.active.write().clear();
                self.ready.open();
            }
        }
    }

    /// Wait for start to finish; true when the host can take calls.
    async fn wait_running(&self) -> bool {
        if self.state() == HostState::Deferred {
            return false;
        }
        self.ready.wait().await;
        self.state() == HostState::Running
    }

    /// Forward an activation event.
    ///
    /// An `Immediate` request to a host whose start was never called is
    /// dropped; the host receives the event when it is replayed at start. A
    /// host that is still starting gets it once it runs.
    pub async fn activate_by_event(&self, event: &str, kind: ActivationKind) -> Result<()> {
        if kind == ActivationKind::Immediate && !self.has_started() {
            debug!(kind = %self.kind, event, "Host not started, skipping immediate activation");
            return Ok(());
        }
        if !self.wait_running().await {
            return Ok(());
        }
        self.host.activate_by_event(event, kind).await
    }

    pub async fn activate(
        &self,
        extension_id: &ExtensionIdentifier,
        reason: &ActivationReason,
    ) -> Result<bool> {
        if !self.wait_running().await {
            return Ok(false);
        }
        let activated = self.host.activate(extension_id, reason).await?;
        if activated {
            self.active.write().insert(extension_id.clone());
        }
        Ok(activated)
    }

    /// Update membership, then forward the delta to the host.
    pub async fn delta_extensions(&self, delta: &ExtensionHostDelta) -> Result<()> {
        self.apply_membership(delta);
        if !self.wait_running().await {
            debug!(kind = %self.kind, "Host not running, delta kept in membership only");
            return Ok(());
        }
        self.host.delta_extensions(delta).await
    }

    fn apply_membership(&self, delta: &ExtensionHostDelta) {
        let mut members = self.members.write();
        let mut active = self.active.write();
        for id in &delta.to_remove {
            members.remove(id);
            active.remove(id);
        }
        for desc in &delta.to_add {
            members.insert(desc.identifier.clone());
        }
    }

    pub fn contains_extension(&self, extension_id: &ExtensionIdentifier) -> bool {
        self.members.read().contains(extension_id)
    }

    pub fn members(&self) -> Vec<ExtensionIdentifier> {
        self.members.read().iter().cloned().collect()
    }

    /// Forget every member, returning them.
    pub fn clear_membership(&self) -> Vec<ExtensionIdentifier> {
        self.active.write().clear();
        self.members.write().drain().collect()
    }

    /// Active or activating in this host.
    pub fn is_extension_active(&self, extension_id: &ExtensionIdentifier) -> bool {
        self.active.read().contains(extension_id)
    }

    pub fn active_extensions(&self) -> Vec<ExtensionIdentifier> {
        self.active.read().iter().cloned().collect()
    }

    pub async fn terminate(&self) {
        {
            let mut state = self.state.write();
            if state.is_alive() {
                *state = HostState::Exited;
            }
        }
        self.deferred.lock().take();
        self.ready.open();
        self.host.terminate().await;
        info!(kind = %self.kind, instance_id = %self.instance_id, "Extension host terminated");
    }
}

impl std::fmt::Debug for ExtensionHostManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHostManager")
            .field("instance_id", &self.instance_id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ExtensionLocation;
    use crate::error::HostError;
    use crate::host::{ExtensionHost, HostExit, NotificationSender};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeHost {
        fail_start: bool,
        start_delay: Option<Duration>,
        lazy: bool,
        starts: parking_lot::Mutex<Vec<Vec<ExtensionIdentifier>>>,
        events: parking_lot::Mutex<Vec<String>>,
        deltas: parking_lot::Mutex<Vec<ExtensionHostDelta>>,
        sender: parking_lot::Mutex<Option<NotificationSender>>,
    }

    #[async_trait::async_trait]
    impl ExtensionHost for FakeHost {
        fn kind(&self) -> ExtensionHostKind {
            ExtensionHostKind::LocalProcess
        }

        fn startup(&self) -> HostStartup {
            if self.lazy {
                HostStartup::Lazy
            } else {
                HostStartup::Eager
            }
        }

        async fn start(&self, init: HostInit) -> Result<()> {
            self.starts.lock().push(init.my_extensions.clone());
            if let Some(delay) = self.start_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_start {
                return Err(HostError::StartFailed(self.kind(), "boom".into()));
            }
            *self.sender.lock() = Some(init.notifications);
            Ok(())
        }

        async fn activate(&self, _id: &ExtensionIdentifier, _reason: &ActivationReason) -> Result<bool> {
            Ok(true)
        }

        async fn activate_by_event(&self, event: &str, _kind: ActivationKind) -> Result<()> {
            self.events.lock().push(event.to_string());
            Ok(())
        }

        async fn delta_extensions(&self, delta: &ExtensionHostDelta) -> Result<()> {
            self.deltas.lock().push(delta.clone());
            Ok(())
        }

        async fn terminate(&self) {}
    }

    fn desc(id: &str) -> Arc<ExtensionDescription> {
        Arc::new(ExtensionDescription::new(
            id,
            semver::Version::new(1, 0, 0),
            ExtensionLocation::local("/ext"),
        ))
    }

    #[tokio::test]
    async fn test_start_replays_initial_events() {
        let host = Arc::new(FakeHost::default());
        let manager = Arc::new(ExtensionHostManager::new(host.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        manager
            .start(vec![desc("pub.a")], vec!["pub.a".into()], tx, vec!["onFoo".into()])
            .await
            .unwrap();

        assert_eq!(manager.state(), HostState::Running);
        assert!(manager.contains_extension(&"PUB.A".into()));
        assert_eq!(*host.events.lock(), vec!["onFoo".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_start_is_a_crash() {
        let host = Arc::new(FakeHost {
            fail_start: true,
            ..Default::default()
        });
        let manager = Arc::new(ExtensionHostManager::new(host));
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(manager.start(vec![], vec![], tx, vec![]).await.is_err());
        assert_eq!(manager.state(), HostState::Crashed);
        assert!(manager.is_ready());
        // Calls on a dead host resolve without reaching it.
        assert!(!manager
            .activate(&"pub.a".into(), &ActivationReason::new("pub.a".into(), "test"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_immediate_activation_before_start_is_skipped() {
        let host = Arc::new(FakeHost::default());
        let manager = ExtensionHostManager::new(host.clone());
        manager
            .activate_by_event("onNow", ActivationKind::Immediate)
            .await
            .unwrap();
        assert!(host.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_exit_notification_is_forwarded_and_tracked() {
        let host = Arc::new(FakeHost::default());
        let manager = Arc::new(ExtensionHostManager::new(host.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.start(vec![], vec![], tx, vec![]).await.unwrap();

        let sender = host.sender.lock().clone().unwrap();
        sender
            .send(HostNotification::WillActivateExtension("pub.a".into()))
            .unwrap();
        sender.send(HostNotification::Exited(HostExit::code(3))).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.instance_id, manager.instance_id());
        let second = rx.recv().await.unwrap();
        assert_eq!(second.notification, HostNotification::Exited(HostExit::code(3)));
        assert_eq!(manager.state(), HostState::Crashed);
        assert!(!manager.is_extension_active(&"pub.a".into()));
    }

    #[tokio::test]
    async fn test_delta_updates_membership() {
        let host = Arc::new(FakeHost::default());
        let manager = Arc::new(ExtensionHostManager::new(host.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();
        manager
            .start(vec![desc("pub.a")], vec!["pub.a".into()], tx, vec![])
            .await
            .unwrap();

        let delta = ExtensionHostDelta {
            to_add: vec![desc("pub.b")],
            to_remove: vec!["pub.a".into()],
        };
        manager.delta_extensions(&delta).await.unwrap();

        assert!(!manager.contains_extension(&"pub.a".into()));
        assert!(manager.contains_extension(&"pub.b".into()));
        assert_eq!(host.deltas.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_immediate_activation_while_starting_waits_for_running() {
        let host = Arc::new(FakeHost {
            start_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let manager = Arc::new(ExtensionHostManager::new(host.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let starting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start(vec![], vec![], tx, vec![]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.has_started());
        assert!(!manager.is_ready());

        manager
            .activate_by_event("onNow", ActivationKind::Immediate)
            .await
            .unwrap();
        assert_eq!(*host.events.lock(), vec!["onNow".to_string()]);
        starting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_deferred_host_starts_on_first_addition() {
        let host = Arc::new(FakeHost {
            lazy: true,
            ..Default::default()
        });
        let manager = Arc::new(ExtensionHostManager::new(host.clone()));
        assert_eq!(manager.startup(), HostStartup::Lazy);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.defer(tx);
        assert!(manager.is_deferred());

        // Calls resolve without reaching the host.
        manager
            .activate_by_event("onFoo", ActivationKind::Normal)
            .await
            .unwrap();
        assert!(!manager
            .activate(&"pub.a".into(), &ActivationReason::new("pub.a".into(), "test"))
            .await
            .unwrap());

        // Plain deltas only touch membership while parked.
        let removal = ExtensionHostDelta {
            to_add: vec![],
            to_remove: vec!["pub.a".into()],
        };
        manager.delta_extensions(&removal).await.unwrap();
        assert!(manager.is_deferred());
        assert!(host.starts.lock().is_empty());

        let addition = ExtensionHostDelta {
            to_add: vec![desc("pub.b")],
            to_remove: vec![],
        };
        manager
            .start_deferred(vec![desc("pub.a"), desc("pub.b")], &addition)
            .await
            .unwrap();
        assert_eq!(manager.state(), HostState::Running);
        assert_eq!(*host.starts.lock(), vec![vec![ExtensionIdentifier::from("pub.b")]]);
        // The addition went in through start, not as a delta.
        assert!(host.deltas.lock().is_empty());
        assert!(manager.contains_extension(&"pub.b".into()));
    }
}
