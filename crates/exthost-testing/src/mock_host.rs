//! In-memory extension host.
//!
//! Records every call it receives, activates its member extensions when a
//! matching activation event arrives and can be told to fail or crash.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exthost_core::collaborators::ExtensionHostFactory;
use exthost_core::host::NotificationSender;
use exthost_core::prelude::*;
use exthost_core::{ActivationTimes, ExtensionHostDelta, HostExit, HostInit, HostStartup};
use parking_lot::Mutex;

/// One call received by a [`MockHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Start {
        my_extensions: Vec<ExtensionIdentifier>,
    },
    Activate {
        extension_id: ExtensionIdentifier,
        event: String,
    },
    ActivateByEvent {
        event: String,
        kind: ActivationKind,
    },
    Delta {
        added: Vec<ExtensionIdentifier>,
        removed: Vec<ExtensionIdentifier>,
    },
    Terminate,
}

#[derive(Default)]
struct MockState {
    known: HashMap<String, Arc<ExtensionDescription>>,
    members: Vec<ExtensionIdentifier>,
    active: HashSet<ExtensionIdentifier>,
    activations: Vec<ExtensionIdentifier>,
    calls: Vec<MockCall>,
    notifications: Option<NotificationSender>,
    failing_events: HashSet<String>,
    failing_extensions: HashSet<ExtensionIdentifier>,
    rejected_extensions: HashSet<ExtensionIdentifier>,
    start_failure: Option<String>,
    start_delay: Option<Duration>,
    activation_delay: Option<Duration>,
    fail_next_delta: bool,
    startup: HostStartup,
}

/// Extension host that lives in the test process.
pub struct MockHost {
    kind: ExtensionHostKind,
    state: Mutex<MockState>,
    terminated: AtomicBool,
}

impl MockHost {
    pub fn new(kind: ExtensionHostKind) -> Self {
        Self {
            kind,
            state: Mutex::new(MockState::default()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Make `start` fail with `message`.
    pub fn fail_start(&self, message: impl Into<String>) {
        self.state.lock().start_failure = Some(message.into());
    }

    /// Make `activate_by_event(event)` fail.
    pub fn fail_event(&self, event: impl Into<String>) {
        self.state.lock().failing_events.insert(event.into());
    }

    /// Make the extension's own activation throw. The failure is reported
    /// as a notification; the activate call itself succeeds.
    pub fn fail_activation(&self, extension_id: impl Into<ExtensionIdentifier>) {
        self.state
            .lock()
            .failing_extensions
            .insert(extension_id.into());
    }

    /// Make `activate(extension_id)` calls fail before reaching the
    /// extension.
    pub fn reject_activation(&self, extension_id: impl Into<ExtensionIdentifier>) {
        self.state
            .lock()
            .rejected_extensions
            .insert(extension_id.into());
    }

    /// Make the next `delta_extensions` call fail.
    pub fn fail_next_delta(&self) {
        self.state.lock().fail_next_delta = true;
    }

    /// Hold every `start` for `delay` before it completes.
    pub fn set_start_delay(&self, delay: Duration) {
        self.state.lock().start_delay = Some(delay);
    }

    pub fn set_startup(&self, startup: HostStartup) {
        self.state.lock().startup = startup;
    }

    /// Delay every activation by `delay`.
    pub fn set_activation_delay(&self, delay: Duration) {
        self.state.lock().activation_delay = Some(delay);
    }

    /// Simulate an unexpected exit.
    pub fn crash(&self, code: i32) {
        tracing::debug!(kind = %self.kind, code, "Mock host crashing");
        self.terminated.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.active.clear();
        if let Some(tx) = &state.notifications {
            let _ = tx.send(HostNotification::Exited(HostExit::code(code)));
        }
    }

    /// Send an arbitrary notification as if the host produced it.
    pub fn emit(&self, notification: HostNotification) {
        if let Some(tx) = &self.state.lock().notifications {
            let _ = tx.send(notification);
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Extensions this host actually activated, in order.
    pub fn activations(&self) -> Vec<ExtensionIdentifier> {
        self.state.lock().activations.clone()
    }

    pub fn members(&self) -> Vec<ExtensionIdentifier> {
        self.state.lock().members.clone()
    }

    pub fn deltas(&self) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, MockCall::Delta { .. }))
            .collect()
    }

    pub fn activation_events(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::ActivateByEvent { event, .. } => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn is_started(&self) -> bool {
        self.calls()
            .iter()
            .any(|call| matches!(call, MockCall::Start { .. }))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(HostError::HostTerminated(self.kind));
        }
        Ok(())
    }

    async fn delay(&self) {
        let delay = self.state.lock().activation_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Activate one member. Returns false when it is not a member.
    fn activate_member(&self, extension_id: &ExtensionIdentifier, event: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.members.contains(extension_id) {
            return Ok(false);
        }
        if state.active.contains(extension_id) {
            return Ok(true);
        }
        let notify = state.notifications.clone();
        let send = |notification| {
            if let Some(tx) = &notify {
                let _ = tx.send(notification);
            }
        };

        send(HostNotification::WillActivateExtension(extension_id.clone()));
        if state.failing_extensions.contains(extension_id) {
            send(HostNotification::ActivationFailed {
                extension_id: extension_id.clone(),
                message: "activate() threw".to_string(),
            });
            return Ok(true);
        }
        state.active.insert(extension_id.clone());
        state.activations.push(extension_id.clone());
        send(HostNotification::DidActivateExtension {
            extension_id: extension_id.clone(),
            times: ActivationTimes {
                code_loading_ms: 1,
                activate_call_ms: 1,
                activate_resolved_ms: 2,
                activation_event: event.to_string(),
            },
        });
        Ok(true)
    }
}

#[async_trait::async_trait]
impl ExtensionHost for MockHost {
    fn kind(&self) -> ExtensionHostKind {
        self.kind
    }

    fn startup(&self) -> HostStartup {
        self.state.lock().startup
    }

    async fn start(&self, init: HostInit) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Start {
                my_extensions: init.my_extensions.clone(),
            });
            state.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(message) = state.start_failure.clone() {
            return Err(HostError::StartFailed(self.kind, message));
        }
        state.known = init
            .all_extensions
            .into_iter()
            .map(|desc| (desc.identifier.key().to_string(), desc))
            .collect();
        state.members = init.my_extensions;
        state.notifications = Some(init.notifications);
        Ok(())
    }

    async fn activate(
        &self,
        extension_id: &ExtensionIdentifier,
        reason: &ActivationReason,
    ) -> Result<bool> {
        let rejected = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::Activate {
                extension_id: extension_id.clone(),
                event: reason.activation_event.clone(),
            });
            state.rejected_extensions.contains(extension_id)
        };
        self.check_alive()?;
        if rejected {
            return Err(HostError::ActivationFailed {
                extension_id: extension_id.clone(),
                message: "activate request rejected".to_string(),
            });
        }
        self.delay().await;
        self.check_alive()?;
        self.activate_member(extension_id, &reason.activation_event)
    }

    async fn activate_by_event(&self, event: &str, kind: ActivationKind) -> Result<()> {
        let (failing, interested) = {
            let mut state = self.state.lock();
            state.calls.push(MockCall::ActivateByEvent {
                event: event.to_string(),
                kind,
            });
            let interested: Vec<ExtensionIdentifier> = state
                .members
                .iter()
                .filter(|id| {
                    state.known.get(id.key()).is_some_and(|desc| {
                        desc.effective_activation_events().any(|e| e == event)
                    })
                })
                .cloned()
                .collect();
            (state.failing_events.contains(event), interested)
        };
        self.check_alive()?;
        if failing {
            return Err(HostError::ActivationEventFailed {
                event: event.to_string(),
                kind: self.kind,
                message: "activation event rejected".to_string(),
            });
        }
        self.delay().await;
        self.check_alive()?;
        for id in interested {
            // Failures are reported through notifications.
            let _ = self.activate_member(&id, event);
        }
        Ok(())
    }

    async fn delta_extensions(&self, delta: &ExtensionHostDelta) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Delta {
            added: delta.to_add.iter().map(|d| d.identifier.clone()).collect(),
            removed: delta.to_remove.clone(),
        });
        if self.is_terminated() {
            return Err(HostError::HostTerminated(self.kind));
        }
        if std::mem::take(&mut state.fail_next_delta) {
            return Err(HostError::Other(format!("{} host dropped the delta", self.kind)));
        }
        for id in &delta.to_remove {
            state.members.retain(|member| member != id);
            state.active.remove(id);
            state.known.remove(id.key());
        }
        for desc in &delta.to_add {
            state
                .known
                .insert(desc.identifier.key().to_string(), desc.clone());
            if !state.members.contains(&desc.identifier) {
                state.members.push(desc.identifier.clone());
            }
        }
        Ok(())
    }

    async fn terminate(&self) {
        let mut state = self.state.lock();
        state.calls.push(MockCall::Terminate);
        if !self.terminated.swap(true, Ordering::SeqCst) {
            if let Some(tx) = &state.notifications {
                let _ = tx.send(HostNotification::Exited(HostExit::clean()));
            }
        }
        state.active.clear();
    }
}

/// Creates a fresh [`MockHost`] per kind on every start cycle and keeps them
/// all for inspection.
pub struct MockHostFactory {
    kinds: Vec<ExtensionHostKind>,
    generations: Mutex<Vec<Vec<Arc<MockHost>>>>,
    initial_starts: Mutex<Vec<bool>>,
    failing_starts: Mutex<HashSet<ExtensionHostKind>>,
    prepare: Mutex<Option<Box<dyn Fn(&MockHost) + Send + Sync>>>,
}

impl MockHostFactory {
    pub fn new(kinds: impl IntoIterator<Item = ExtensionHostKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            generations: Mutex::new(Vec::new()),
            initial_starts: Mutex::new(Vec::new()),
            failing_starts: Mutex::new(HashSet::new()),
            prepare: Mutex::new(None),
        }
    }

    /// Hosts of `kind` created from now on fail to start.
    pub fn fail_start(&self, kind: ExtensionHostKind) {
        self.failing_starts.lock().insert(kind);
    }

    /// Run `prepare` on every host before it is handed out.
    pub fn on_create(&self, prepare: impl Fn(&MockHost) + Send + Sync + 'static) {
        *self.prepare.lock() = Some(Box::new(prepare));
    }

    /// Latest host of `kind`.
    pub fn host(&self, kind: ExtensionHostKind) -> Option<Arc<MockHost>> {
        self.generations
            .lock()
            .last()?
            .iter()
            .find(|host| host.kind == kind)
            .cloned()
    }

    /// Every host of `kind` ever created, oldest first.
    pub fn hosts(&self, kind: ExtensionHostKind) -> Vec<Arc<MockHost>> {
        self.generations
            .lock()
            .iter()
            .flatten()
            .filter(|host| host.kind == kind)
            .cloned()
            .collect()
    }

    pub fn generation_count(&self) -> usize {
        self.generations.lock().len()
    }

    /// `is_initial_start` flag of each start cycle.
    pub fn initial_starts(&self) -> Vec<bool> {
        self.initial_starts.lock().clone()
    }
}

#[async_trait::async_trait]
impl ExtensionHostFactory for MockHostFactory {
    async fn create_hosts(&self, is_initial_start: bool) -> Vec<DynExtensionHost> {
        let failing = self.failing_starts.lock().clone();
        let prepare = self.prepare.lock();
        let hosts: Vec<Arc<MockHost>> = self
            .kinds
            .iter()
            .map(|kind| {
                let host = MockHost::new(*kind);
                if failing.contains(kind) {
                    host.fail_start("start refused");
                }
                if let Some(prepare) = prepare.as_ref() {
                    prepare(&host);
                }
                Arc::new(host)
            })
            .collect();
        drop(prepare);

        self.initial_starts.lock().push(is_initial_start);
        self.generations.lock().push(hosts.clone());
        hosts
            .into_iter()
            .map(|host| host as DynExtensionHost)
            .collect()
    }
}
