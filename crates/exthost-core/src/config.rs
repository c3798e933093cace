//! Configuration defaults and environment overrides.
//!
//! Every tunable has a constant in [`defaults`], an environment variable in
//! [`env_vars`] and a getter that parses the variable and falls back to the
//! default. [`OrchestratorConfig::from_env`] gathers them in one place.

use std::path::PathBuf;
use std::time::Duration;

use crate::description::ExtensionKind;

/// Default values.
pub mod defaults {
    /// Seconds a lock holder may keep the lock before a warning is logged.
    pub const LOCK_WARN_SECS: u64 = 30;
    /// Seconds to wait for a process host to acknowledge `start`.
    pub const HOST_START_TIMEOUT_SECS: u64 = 60;
    /// Milliseconds between responsiveness pings to a process host.
    pub const HOST_PING_INTERVAL_MS: u64 = 1000;
    /// Milliseconds without a pong after which a host counts as unresponsive.
    pub const HOST_UNRESPONSIVE_MS: u64 = 3000;
    /// Capacity of the orchestrator event bus.
    pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
    /// Default log filter for binaries.
    pub const LOG_FILTER: &str = "exthost=info";
}

/// Environment variable names.
pub mod env_vars {
    pub const LOCK_WARN_SECS: &str = "EXTHOST_LOCK_WARN_SECS";
    pub const HOST_START_TIMEOUT_SECS: &str = "EXTHOST_HOST_START_TIMEOUT_SECS";
    pub const HOST_PING_INTERVAL_MS: &str = "EXTHOST_HOST_PING_INTERVAL_MS";
    pub const HOST_UNRESPONSIVE_MS: &str = "EXTHOST_HOST_UNRESPONSIVE_MS";
    /// Run as an extension development host.
    pub const DEV_HOST: &str = "EXTHOST_DEV_HOST";
    /// Comma separated kinds forced on extensions under development.
    pub const DEV_EXTENSION_KIND: &str = "EXTHOST_DEV_EXTENSION_KIND";
    pub const REMOTE_HOST: &str = "EXTHOST_REMOTE_HOST";
    pub const WEB_WORKER_HOST: &str = "EXTHOST_WEB_WORKER_HOST";
    /// Program launched for process hosts.
    pub const HOST_PROGRAM: &str = "EXTHOST_HOST_PROGRAM";
    pub const LOG_JSON: &str = "EXTHOST_LOG_JSON";
}

fn parse_flag(value: Option<String>) -> Option<bool> {
    match value?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_kinds(value: &str) -> Option<Vec<ExtensionKind>> {
    let kinds: Option<Vec<ExtensionKind>> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.to_ascii_lowercase().as_str() {
            "ui" => Some(ExtensionKind::Ui),
            "workspace" => Some(ExtensionKind::Workspace),
            "web" => Some(ExtensionKind::Web),
            _ => None,
        })
        .collect();
    kinds.filter(|k| !k.is_empty())
}

fn env_flag(name: &str) -> bool {
    parse_flag(std::env::var(name).ok()).unwrap_or(false)
}

/// Lock warning threshold from the environment, or the default.
pub fn lock_warn_threshold() -> Duration {
    let secs = std::env::var(env_vars::LOCK_WARN_SECS)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(defaults::LOCK_WARN_SECS);
    Duration::from_secs(secs)
}

pub fn host_start_timeout() -> Duration {
    let secs = std::env::var(env_vars::HOST_START_TIMEOUT_SECS)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(defaults::HOST_START_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

fn env_millis(name: &str, default: u64) -> Duration {
    let millis = std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|ms| *ms > 0)
        .unwrap_or(default);
    Duration::from_millis(millis)
}

pub fn host_ping_interval() -> Duration {
    env_millis(env_vars::HOST_PING_INTERVAL_MS, defaults::HOST_PING_INTERVAL_MS)
}

pub fn host_unresponsive_timeout() -> Duration {
    env_millis(env_vars::HOST_UNRESPONSIVE_MS, defaults::HOST_UNRESPONSIVE_MS)
}

pub fn is_dev_host() -> bool {
    env_flag(env_vars::DEV_HOST)
}

pub fn development_extension_kind() -> Option<Vec<ExtensionKind>> {
    std::env::var(env_vars::DEV_EXTENSION_KIND)
        .ok()
        .and_then(|s| parse_kinds(&s))
}

pub fn log_json() -> bool {
    env_flag(env_vars::LOG_JSON)
}

/// Command line used to launch a process host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lock_warn_threshold: Duration,
    pub host_start_timeout: Duration,
    pub host_ping_interval: Duration,
    /// A host that leaves a ping unanswered this long is unresponsive.
    pub host_unresponsive_timeout: Duration,
    /// Host exit is a shutdown request rather than a crash.
    pub is_dev_host: bool,
    /// Kinds forced on extensions under development.
    pub development_kind: Option<Vec<ExtensionKind>>,
    pub has_remote_host: bool,
    pub has_web_worker_host: bool,
    pub event_capacity: usize,
    pub host_command: Option<HostCommand>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_warn_threshold: Duration::from_secs(defaults::LOCK_WARN_SECS),
            host_start_timeout: Duration::from_secs(defaults::HOST_START_TIMEOUT_SECS),
            host_ping_interval: Duration::from_millis(defaults::HOST_PING_INTERVAL_MS),
            host_unresponsive_timeout: Duration::from_millis(defaults::HOST_UNRESPONSIVE_MS),
            is_dev_host: false,
            development_kind: None,
            has_remote_host: false,
            has_web_worker_host: false,
            event_capacity: defaults::EVENT_CHANNEL_CAPACITY,
            host_command: None,
        }
    }
}

impl OrchestratorConfig {
    /// Build a configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            lock_warn_threshold: lock_warn_threshold(),
            host_start_timeout: host_start_timeout(),
            host_ping_interval: host_ping_interval(),
            host_unresponsive_timeout: host_unresponsive_timeout(),
            is_dev_host: is_dev_host(),
            development_kind: development_extension_kind(),
            has_remote_host: env_flag(env_vars::REMOTE_HOST),
            has_web_worker_host: env_flag(env_vars::WEB_WORKER_HOST),
            event_capacity: defaults::EVENT_CHANNEL_CAPACITY,
            host_command: std::env::var(env_vars::HOST_PROGRAM)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(HostCommand::new),
        }
    }

    pub fn with_remote_host(mut self, enabled: bool) -> Self {
        self.has_remote_host = enabled;
        self
    }

    pub fn with_web_worker_host(mut self, enabled: bool) -> Self {
        self.has_web_worker_host = enabled;
        self
    }

    pub fn with_dev_host(mut self, enabled: bool) -> Self {
        self.is_dev_host = enabled;
        self
    }

    pub fn with_development_kind(mut self, kinds: Vec<ExtensionKind>) -> Self {
        self.development_kind = Some(kinds);
        self
    }

    pub fn with_host_command(mut self, command: HostCommand) -> Self {
        self.host_command = Some(command);
        self
    }

    pub fn with_host_ping(mut self, interval: Duration, unresponsive_after: Duration) -> Self {
        self.host_ping_interval = interval;
        self.host_unresponsive_timeout = unresponsive_after;
        self
    }
}
