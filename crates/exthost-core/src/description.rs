//! Extension identifiers and descriptions.
//!
//! A description is the resolved, immutable form of an extension manifest.
//! Once it enters the registry it is shared as `Arc<ExtensionDescription>`;
//! an update is always a removal followed by an addition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Activation event every extension may declare to run on any request.
pub const WILDCARD_ACTIVATION_EVENT: &str = "*";

/// Activation event fired once the initial scan has been registered.
pub const ON_STARTUP_FINISHED: &str = "onStartupFinished";

/// Prefix of activation events answered by the workspace-contains check.
pub const WORKSPACE_CONTAINS_PREFIX: &str = "workspaceContains";

/// Bare `onUri` declaration, expanded per extension on replay.
pub const ON_URI: &str = "onUri";

/// Namespaced extension id (`publisher.name`).
///
/// Comparison and hashing use the lower-cased key; the original spelling is
/// kept for display.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ExtensionIdentifier {
    value: String,
    key: String,
}

impl ExtensionIdentifier {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let key = value.to_lowercase();
        Self { value, key }
    }

    /// The id as declared.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The case-insensitive comparison key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl PartialEq for ExtensionIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ExtensionIdentifier {}

impl Hash for ExtensionIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for ExtensionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl fmt::Display for ExtensionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl From<String> for ExtensionIdentifier {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for ExtensionIdentifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<ExtensionIdentifier> for String {
    fn from(id: ExtensionIdentifier) -> Self {
        id.value
    }
}

/// Where an extension is allowed to run, as declared in its manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionKind {
    /// Runs next to the UI, in the local process host.
    Ui,
    /// Runs where the workspace is (remote when there is a remote).
    Workspace,
    /// Runs in the in-page web worker host.
    Web,
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ui => write!(f, "ui"),
            Self::Workspace => write!(f, "workspace"),
            Self::Web => write!(f, "web"),
        }
    }
}

/// Where an extension's files are installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum ExtensionLocation {
    Local { path: PathBuf },
    Remote { authority: String, path: PathBuf },
}

impl ExtensionLocation {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    pub fn remote(authority: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Remote {
            authority: authority.into(),
            path: path.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// True when both locations live on the same side (local or remote).
    pub fn same_side(&self, other: &ExtensionLocation) -> bool {
        self.is_remote() == other.is_remote()
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Local { path } | Self::Remote { path, .. } => path,
        }
    }
}

/// Resolved extension manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescription {
    pub identifier: ExtensionIdentifier,
    pub version: semver::Version,
    /// Stable id across renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<uuid::Uuid>,
    #[serde(default)]
    pub extension_kind: Vec<ExtensionKind>,
    #[serde(default)]
    pub activation_events: Vec<String>,
    #[serde(default)]
    pub extension_dependencies: Vec<ExtensionIdentifier>,
    pub location: ExtensionLocation,
    #[serde(default)]
    pub is_builtin: bool,
    #[serde(default)]
    pub is_under_development: bool,
}

impl ExtensionDescription {
    pub fn new(
        identifier: impl Into<ExtensionIdentifier>,
        version: semver::Version,
        location: ExtensionLocation,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            version,
            uuid: None,
            extension_kind: Vec::new(),
            activation_events: Vec::new(),
            extension_dependencies: Vec::new(),
            location,
            is_builtin: false,
            is_under_development: false,
        }
    }

    pub fn with_uuid(mut self, uuid: uuid::Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ExtensionKind>) -> Self {
        self.extension_kind = kinds.into_iter().collect();
        self
    }

    pub fn with_activation_events<S: Into<String>>(
        mut self,
        events: impl IntoIterator<Item = S>,
    ) -> Self {
        self.activation_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I: Into<ExtensionIdentifier>>(
        mut self,
        deps: impl IntoIterator<Item = I>,
    ) -> Self {
        self.extension_dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn under_development(mut self) -> Self {
        self.is_under_development = true;
        self
    }

    pub fn is_remote(&self) -> bool {
        self.location.is_remote()
    }

    /// Handle pointing back at this description's install.
    pub fn handle(&self) -> ExtensionHandle {
        ExtensionHandle {
            identifier: self.identifier.clone(),
            location: self.location.clone(),
        }
    }

    /// Declared events with `onUri` expanded to `onUri:<id>`.
    pub fn effective_activation_events(&self) -> impl Iterator<Item = String> + '_ {
        self.activation_events.iter().map(|event| {
            if event == ON_URI {
                format!("{}:{}", ON_URI, self.identifier.key())
            } else {
                event.clone()
            }
        })
    }

    pub fn has_workspace_contains(&self) -> bool {
        self.activation_events
            .iter()
            .any(|event| event.starts_with(WORKSPACE_CONTAINS_PREFIX))
    }
}

/// An installed-but-unresolved extension as reported by the installer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionHandle {
    pub identifier: ExtensionIdentifier,
    pub location: ExtensionLocation,
}

impl ExtensionHandle {
    pub fn new(identifier: impl Into<ExtensionIdentifier>, location: ExtensionLocation) -> Self {
        Self {
            identifier: identifier.into(),
            location,
        }
    }
}

/// Target of a removal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalTarget {
    /// Remove whatever is registered under this id (uninstall).
    Id(ExtensionIdentifier),
    /// Remove only if the registered copy lives on the handle's side (disable).
    Handle(ExtensionHandle),
}

impl RemovalTarget {
    pub fn identifier(&self) -> &ExtensionIdentifier {
        match self {
            Self::Id(id) => id,
            Self::Handle(handle) => &handle.identifier,
        }
    }

    /// Whether this target refers to the registered `description`.
    pub fn matches_location(&self, description: &ExtensionDescription) -> bool {
        match self {
            Self::Id(_) => true,
            Self::Handle(handle) => handle.location.same_side(&description.location),
        }
    }
}

impl From<ExtensionIdentifier> for RemovalTarget {
    fn from(id: ExtensionIdentifier) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for RemovalTarget {
    fn from(id: &str) -> Self {
        Self::Id(ExtensionIdentifier::new(id))
    }
}

impl From<ExtensionHandle> for RemovalTarget {
    fn from(handle: ExtensionHandle) -> Self {
        Self::Handle(handle)
    }
}
