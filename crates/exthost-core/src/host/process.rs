//! Extension host running in a child process.
//!
//! The child is spawned with piped stdio and spoken to with the line
//! protocol from [`super::protocol`]. Replies are matched to requests by id;
//! when the child exits every pending request fails with `HostTerminated`
//! and an `Exited` notification is sent. Once started, the host is pinged
//! periodically and a `ResponsiveStateChanged` notification is sent whenever
//! a ping goes unanswered or answers resume.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::protocol::{decode_line, encode_line, HostRequest, RunnerMessage, HOST_PROTOCOL_VERSION};
use super::{
    ActivationKind, ActivationReason, DynExtensionHost, ExtensionHost, ExtensionHostDelta,
    ExtensionHostKind, HostExit, HostInit, HostNotification, HostStartup, NotificationSender,
};
use crate::collaborators::ExtensionHostFactory;
use crate::config::{defaults, HostCommand, OrchestratorConfig};
use crate::description::ExtensionIdentifier;
use crate::error::{HostError, Result};

type PendingReplies = parking_lot::Mutex<HashMap<u64, oneshot::Sender<RunnerMessage>>>;

/// How long `terminate` waits for a graceful shutdown before killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Request plumbing shared by the host, its output reader, the exit watcher
/// and the pinger.
struct HostChannel {
    kind: ExtensionHostKind,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingReplies,
    next_request_id: AtomicU64,
    terminated: AtomicBool,
}

/// Removes a pending entry when its request is dropped before the reply.
struct PendingGuard<'a> {
    pending: &'a PendingReplies,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

impl HostChannel {
    fn new(kind: ExtensionHostKind) -> Self {
        Self {
            kind,
            stdin: Mutex::new(None),
            pending: parking_lot::Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its reply.
    async fn request(&self, build: impl FnOnce(u64) -> HostRequest) -> Result<RunnerMessage> {
        if self.is_terminated() {
            return Err(HostError::HostTerminated(self.kind));
        }
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = build(request_id);
        let line = encode_line(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };
        // The exit watcher may have drained the table before the insert.
        if self.is_terminated() {
            return Err(HostError::HostTerminated(self.kind));
        }

        {
            let mut stdin = self.stdin.lock().await;
            let Some(stdin) = stdin.as_mut() else {
                return Err(HostError::HostTerminated(self.kind));
            };
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!(kind = %self.kind, error = %e, "Write to host failed");
                return Err(HostError::HostTerminated(self.kind));
            }
        }

        match rx.await {
            Ok(RunnerMessage::Failed { error, .. }) => Err(HostError::Other(error)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(HostError::HostTerminated(self.kind)),
        }
    }

    /// Route runner output: replies to their pending request, events to the
    /// notification channel.
    fn spawn_reader(
        self: &Arc<Self>,
        stdout: tokio::process::ChildStdout,
        notifications: NotificationSender,
    ) {
        let channel = self.clone();
        tokio::spawn(async move {
            let kind = channel.kind;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Reading host output failed");
                        break;
                    }
                };
                let message = match decode_line::<RunnerMessage>(&line) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Ignoring malformed host message");
                        continue;
                    }
                };
                match message.request_id() {
                    Some(request_id) => {
                        if let Some(tx) = channel.pending.lock().remove(&request_id) {
                            let _ = tx.send(message);
                        } else {
                            debug!(kind = %kind, request_id, "Reply for unknown request");
                        }
                    }
                    None => {
                        if let Some(notification) = message.into_notification() {
                            let _ = notifications.send(notification);
                        }
                    }
                }
            }
        });
    }

    /// Ping every `interval`; a ping without a pong within `unresponsive_after`
    /// marks the host unresponsive until a later ping is answered.
    fn spawn_pinger(
        self: &Arc<Self>,
        interval: Duration,
        unresponsive_after: Duration,
        notifications: NotificationSender,
    ) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            let kind = channel.kind;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            let mut responsive = true;
            loop {
                ticker.tick().await;
                if channel.is_terminated() {
                    break;
                }
                let reply = tokio::time::timeout(
                    unresponsive_after,
                    channel.request(|request_id| HostRequest::Ping { request_id }),
                )
                .await;
                let answered = match reply {
                    Ok(Ok(_)) => true,
                    Ok(Err(HostError::HostTerminated(_))) => break,
                    Ok(Err(e)) => {
                        debug!(kind = %kind, error = %e, "Ping failed");
                        false
                    }
                    Err(_) => false,
                };
                if answered == responsive {
                    continue;
                }
                responsive = answered;
                if responsive {
                    info!(kind = %kind, "Host is responsive again");
                } else {
                    warn!(kind = %kind, timeout = ?unresponsive_after, "Host stopped answering pings");
                }
                if notifications
                    .send(HostNotification::ResponsiveStateChanged(responsive))
                    .is_err()
                {
                    break;
                }
            }
        })
    }
}

/// Host backed by a child process.
pub struct ProcessExtensionHost {
    command: HostCommand,
    start_timeout: Duration,
    ping_interval: Duration,
    unresponsive_after: Duration,
    startup: HostStartup,
    channel: Arc<HostChannel>,
    kill_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pinger: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ProcessExtensionHost {
    pub fn new(kind: ExtensionHostKind, command: HostCommand, start_timeout: Duration) -> Self {
        Self {
            command,
            start_timeout,
            ping_interval: Duration::from_millis(defaults::HOST_PING_INTERVAL_MS),
            unresponsive_after: Duration::from_millis(defaults::HOST_UNRESPONSIVE_MS),
            startup: HostStartup::Eager,
            channel: Arc::new(HostChannel::new(kind)),
            kill_tx: parking_lot::Mutex::new(None),
            watcher: parking_lot::Mutex::new(None),
            pinger: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_ping(mut self, interval: Duration, unresponsive_after: Duration) -> Self {
        self.ping_interval = interval;
        self.unresponsive_after = unresponsive_after;
        self
    }

    pub fn with_startup(mut self, startup: HostStartup) -> Self {
        self.startup = startup;
        self
    }

    pub fn is_terminated(&self) -> bool {
        self.channel.is_terminated()
    }

    async fn request(&self, build: impl FnOnce(u64) -> HostRequest) -> Result<RunnerMessage> {
        self.channel.request(build).await
    }
}

fn host_exit(status: &ExitStatus) -> HostExit {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(status);
    #[cfg(not(unix))]
    let signal = None;
    HostExit {
        code: status.code().unwrap_or(if signal.is_some() { 1 } else { 0 }),
        signal,
    }
}

#[async_trait::async_trait]
impl ExtensionHost for ProcessExtensionHost {
    fn kind(&self) -> ExtensionHostKind {
        self.channel.kind
    }

    fn startup(&self) -> HostStartup {
        self.startup
    }

    async fn start(&self, init: HostInit) -> Result<()> {
        let kind = self.channel.kind;
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::StartFailed(kind, e.to_string()))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(HostError::StartFailed(
                kind,
                "host stdio is not piped".to_string(),
            ));
        };
        *self.channel.stdin.lock().await = Some(stdin);
        info!(kind = %kind, pid = ?child.id(), program = ?self.command.program, "Spawned host process");

        self.channel.spawn_reader(stdout, init.notifications.clone());

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        *self.kill_tx.lock() = Some(kill_tx);
        let channel = self.channel.clone();
        let notifications = init.notifications.clone();
        let watcher = tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            channel.terminated.store(true, Ordering::SeqCst);
            // Dropping the senders fails every pending request.
            channel.pending.lock().clear();
            let exit = match status {
                Ok(status) => host_exit(&status),
                Err(e) => {
                    error!(kind = %kind, error = %e, "Waiting for host process failed");
                    HostExit::code(-1)
                }
            };
            info!(kind = %kind, code = exit.code, signal = ?exit.signal, "Host process exited");
            let _ = notifications.send(HostNotification::Exited(exit));
        });
        *self.watcher.lock() = Some(watcher);

        let all_extensions = init
            .all_extensions
            .iter()
            .map(|desc| desc.as_ref().clone())
            .collect();
        let my_extensions = init.my_extensions;
        let reply = tokio::time::timeout(
            self.start_timeout,
            self.request(|request_id| HostRequest::Start {
                request_id,
                protocol_version: HOST_PROTOCOL_VERSION,
                host_kind: kind,
                all_extensions,
                my_extensions,
            }),
        )
        .await
        .map_err(|_| HostError::Timeout)??;

        match reply {
            RunnerMessage::Ack {
                protocol_version: Some(version),
                ..
            } if version != HOST_PROTOCOL_VERSION => {
                return Err(HostError::Protocol(format!(
                    "host speaks protocol {version}, expected {HOST_PROTOCOL_VERSION}"
                )))
            }
            RunnerMessage::Ack { .. } => {}
            other => {
                return Err(HostError::Protocol(format!(
                    "unexpected reply to start: {other:?}"
                )))
            }
        }

        let pinger = self.channel.spawn_pinger(
            self.ping_interval,
            self.unresponsive_after,
            init.notifications,
        );
        *self.pinger.lock() = Some(pinger);
        Ok(())
    }

    async fn activate(
        &self,
        extension_id: &ExtensionIdentifier,
        reason: &ActivationReason,
    ) -> Result<bool> {
        let reply = self
            .request(|request_id| HostRequest::Activate {
                request_id,
                extension_id: extension_id.clone(),
                reason: reason.clone(),
            })
            .await
            .map_err(|e| match e {
                HostError::Other(message) => HostError::ActivationFailed {
                    extension_id: extension_id.clone(),
                    message,
                },
                other => other,
            })?;
        match reply {
            RunnerMessage::Activated { activated, .. } => Ok(activated),
            other => Err(HostError::Protocol(format!(
                "unexpected reply to activate: {other:?}"
            ))),
        }
    }

    async fn activate_by_event(&self, event: &str, activation_kind: ActivationKind) -> Result<()> {
        self.request(|request_id| HostRequest::ActivateByEvent {
            request_id,
            event: event.to_string(),
            activation_kind,
        })
        .await
        .map_err(|e| match e {
            HostError::Other(message) => HostError::ActivationEventFailed {
                event: event.to_string(),
                kind: self.channel.kind,
                message,
            },
            other => other,
        })?;
        Ok(())
    }

    async fn delta_extensions(&self, delta: &ExtensionHostDelta) -> Result<()> {
        self.request(|request_id| HostRequest::DeltaExtensions {
            request_id,
            to_add: delta.to_add.iter().map(|desc| desc.as_ref().clone()).collect(),
            to_remove: delta.to_remove.clone(),
        })
        .await?;
        Ok(())
    }

    async fn terminate(&self) {
        if let Some(pinger) = self.pinger.lock().take() {
            pinger.abort();
        }
        if !self.is_terminated() {
            let shutdown = self.request(|request_id| HostRequest::Shutdown { request_id });
            if tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await.is_err() {
                warn!(kind = %self.channel.kind, "Host did not acknowledge shutdown, killing");
            }
        }
        if let Some(kill_tx) = self.kill_tx.lock().take() {
            let _ = kill_tx.send(());
        }
        self.channel.stdin.lock().await.take();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, watcher).await;
        }
        self.channel.terminated.store(true, Ordering::SeqCst);
    }
}

/// Creates one process host per configured kind, each launched as
/// `<program> <args> --kind <kind>`.
#[derive(Debug, Clone)]
pub struct ProcessHostFactory {
    command: HostCommand,
    kinds: Vec<ExtensionHostKind>,
    lazy_kinds: Vec<ExtensionHostKind>,
    start_timeout: Duration,
    ping_interval: Duration,
    unresponsive_after: Duration,
}

impl ProcessHostFactory {
    pub fn new(command: HostCommand, start_timeout: Duration) -> Self {
        Self {
            command,
            kinds: vec![ExtensionHostKind::LocalProcess],
            lazy_kinds: Vec::new(),
            start_timeout,
            ping_interval: Duration::from_millis(defaults::HOST_PING_INTERVAL_MS),
            unresponsive_after: Duration::from_millis(defaults::HOST_UNRESPONSIVE_MS),
        }
    }

    /// Build from the orchestrator config. The local process host is always
    /// created; remote and web worker hosts follow the config flags. The web
    /// worker host waits for its first extension on the initial start.
    pub fn from_config(config: &OrchestratorConfig) -> Option<Self> {
        let command = config.host_command.clone()?;
        let mut factory = Self::new(command, config.host_start_timeout)
            .with_ping(config.host_ping_interval, config.host_unresponsive_timeout);
        if config.has_web_worker_host {
            factory.kinds.push(ExtensionHostKind::LocalWebWorker);
            factory.lazy_kinds.push(ExtensionHostKind::LocalWebWorker);
        }
        if config.has_remote_host {
            factory.kinds.push(ExtensionHostKind::Remote);
        }
        Some(factory)
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ExtensionHostKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    /// Kinds started lazily when the hosts are first created. Restarted
    /// hosts always start eagerly.
    pub fn with_lazy_kinds(mut self, kinds: impl IntoIterator<Item = ExtensionHostKind>) -> Self {
        self.lazy_kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_ping(mut self, interval: Duration, unresponsive_after: Duration) -> Self {
        self.ping_interval = interval;
        self.unresponsive_after = unresponsive_after;
        self
    }

    pub fn kinds(&self) -> &[ExtensionHostKind] {
        &self.kinds
    }

    fn command_for(&self, kind: ExtensionHostKind) -> HostCommand {
        self.command.clone().arg("--kind").arg(kind.as_str())
    }

    fn startup_for(&self, kind: ExtensionHostKind, is_initial_start: bool) -> HostStartup {
        if is_initial_start && self.lazy_kinds.contains(&kind) {
            HostStartup::Lazy
        } else {
            HostStartup::Eager
        }
    }
}

#[async_trait::async_trait]
impl ExtensionHostFactory for ProcessHostFactory {
    async fn create_hosts(&self, is_initial_start: bool) -> Vec<DynExtensionHost> {
        debug!(is_initial_start, kinds = ?self.kinds, "Creating process hosts");
        self.kinds
            .iter()
            .map(|kind| {
                let host = ProcessExtensionHost::new(*kind, self.command_for(*kind), self.start_timeout)
                    .with_ping(self.ping_interval, self.unresponsive_after)
                    .with_startup(self.startup_for(*kind, is_initial_start));
                Arc::new(host) as DynExtensionHost
            })
            .collect()
    }
}
