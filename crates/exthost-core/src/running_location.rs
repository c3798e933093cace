//! Deciding which host runs each extension.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::description::{ExtensionDescription, ExtensionKind};
use crate::host::ExtensionHostKind;

/// Where an extension runs. `None` means it cannot run anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtensionRunningLocation {
    None,
    LocalProcess,
    LocalWebWorker,
    Remote,
}

impl ExtensionRunningLocation {
    /// The host kind serving this location.
    pub fn host_kind(&self) -> Option<ExtensionHostKind> {
        match self {
            Self::None => None,
            Self::LocalProcess => Some(ExtensionHostKind::LocalProcess),
            Self::LocalWebWorker => Some(ExtensionHostKind::LocalWebWorker),
            Self::Remote => Some(ExtensionHostKind::Remote),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalProcess | Self::LocalWebWorker)
    }
}

impl fmt::Display for ExtensionRunningLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::LocalProcess => write!(f, "local-process"),
            Self::LocalWebWorker => write!(f, "local-web-worker"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Which side should win when an extension could run on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtensionRunningPreference {
    #[default]
    None,
    Local,
    Remote,
}

impl ExtensionRunningPreference {
    fn accepts(&self, location: ExtensionRunningLocation) -> bool {
        match self {
            Self::None => true,
            Self::Local => location.is_local(),
            Self::Remote => location == ExtensionRunningLocation::Remote,
        }
    }
}

/// Pure classifier over the available host kinds.
#[derive(Debug, Clone, Default)]
pub struct RunningLocationClassifier {
    has_remote_host: bool,
    has_web_worker_host: bool,
    development_kind: Option<Vec<ExtensionKind>>,
}

impl RunningLocationClassifier {
    pub fn new(has_remote_host: bool, has_web_worker_host: bool) -> Self {
        Self {
            has_remote_host,
            has_web_worker_host,
            development_kind: None,
        }
    }

    /// Force `kinds` on every extension under development.
    pub fn with_development_kind(mut self, kinds: Option<Vec<ExtensionKind>>) -> Self {
        self.development_kind = kinds;
        self
    }

    pub fn has_remote_host(&self) -> bool {
        self.has_remote_host
    }

    pub fn has_web_worker_host(&self) -> bool {
        self.has_web_worker_host
    }

    /// Effective kinds of `description`, defaulting to `workspace`.
    pub fn get_extension_kind(&self, description: &ExtensionDescription) -> Vec<ExtensionKind> {
        if description.is_under_development {
            if let Some(kinds) = &self.development_kind {
                return kinds.clone();
            }
        }
        if description.extension_kind.is_empty() {
            vec![ExtensionKind::Workspace]
        } else {
            description.extension_kind.clone()
        }
    }

    /// Walk `kinds` in order and pick the first location honouring
    /// `preference`, falling back to the first possible location at all.
    pub fn pick_running_location(
        &self,
        kinds: &[ExtensionKind],
        is_installed_locally: bool,
        is_installed_remotely: bool,
        preference: ExtensionRunningPreference,
    ) -> ExtensionRunningLocation {
        let mut candidates = Vec::new();
        for kind in kinds {
            let location = match kind {
                ExtensionKind::Ui if is_installed_locally => {
                    Some(ExtensionRunningLocation::LocalProcess)
                }
                ExtensionKind::Workspace if is_installed_remotely => {
                    Some(ExtensionRunningLocation::Remote)
                }
                // Without a remote, workspace extensions run locally.
                ExtensionKind::Workspace if !self.has_remote_host => {
                    Some(ExtensionRunningLocation::LocalProcess)
                }
                ExtensionKind::Web if is_installed_locally && self.has_web_worker_host => {
                    Some(ExtensionRunningLocation::LocalWebWorker)
                }
                _ => None,
            };
            if let Some(location) = location {
                if preference.accepts(location) {
                    return location;
                }
                candidates.push(location);
            }
        }
        candidates
            .first()
            .copied()
            .unwrap_or(ExtensionRunningLocation::None)
    }

    /// Classify one description as found on one side.
    pub fn classify(&self, description: &ExtensionDescription) -> ExtensionRunningLocation {
        let is_remote = description.is_remote();
        self.pick_running_location(
            &self.get_extension_kind(description),
            !is_remote,
            is_remote,
            ExtensionRunningPreference::None,
        )
    }

    /// Classify a whole scan. An extension under development on exactly one
    /// side prefers that side.
    pub fn determine_running_location(
        &self,
        local: &[ExtensionDescription],
        remote: &[ExtensionDescription],
    ) -> HashMap<String, ExtensionRunningLocation> {
        let mut kinds: HashMap<String, Vec<ExtensionKind>> = HashMap::new();
        for desc in local.iter().chain(remote) {
            kinds.insert(desc.identifier.key().to_string(), self.get_extension_kind(desc));
        }

        let keys = |list: &[ExtensionDescription], dev_only: bool| -> HashSet<String> {
            list.iter()
                .filter(|desc| !dev_only || desc.is_under_development)
                .map(|desc| desc.identifier.key().to_string())
                .collect()
        };
        let local_set = keys(local, false);
        let remote_set = keys(remote, false);
        let local_dev = keys(local, true);
        let remote_dev = keys(remote, true);

        let mut result = HashMap::new();
        for desc in local.iter().chain(remote) {
            let key = desc.identifier.key();
            let preference = match (local_dev.contains(key), remote_dev.contains(key)) {
                (true, false) => ExtensionRunningPreference::Local,
                (false, true) => ExtensionRunningPreference::Remote,
                _ => ExtensionRunningPreference::None,
            };
            let location = self.pick_running_location(
                kinds.get(key).map(Vec::as_slice).unwrap_or_default(),
                local_set.contains(key),
                remote_set.contains(key),
                preference,
            );
            result.insert(key.to_string(), location);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::ExtensionLocation;
    use ExtensionKind::*;
    use ExtensionRunningLocation as Loc;
    use ExtensionRunningPreference as Pref;

    fn local(id: &str, kinds: &[ExtensionKind]) -> ExtensionDescription {
        ExtensionDescription::new(id, semver::Version::new(1, 0, 0), ExtensionLocation::local("/ext"))
            .with_kinds(kinds.iter().copied())
    }

    fn remote(id: &str, kinds: &[ExtensionKind]) -> ExtensionDescription {
        ExtensionDescription::new(
            id,
            semver::Version::new(1, 0, 0),
            ExtensionLocation::remote("box", "/ext"),
        )
        .with_kinds(kinds.iter().copied())
    }

    #[test]
    fn test_ui_runs_locally() {
        let classifier = RunningLocationClassifier::new(true, false);
        assert_eq!(
            classifier.pick_running_location(&[Ui], true, false, Pref::None),
            Loc::LocalProcess
        );
        assert_eq!(
            classifier.pick_running_location(&[Ui], false, true, Pref::None),
            Loc::None
        );
    }

    #[test]
    fn test_workspace_placement() {
        let with_remote = RunningLocationClassifier::new(true, false);
        assert_eq!(
            with_remote.pick_running_location(&[Workspace], false, true, Pref::None),
            Loc::Remote
        );
        // Installed locally only, but a remote exists: nowhere to run.
        assert_eq!(
            with_remote.pick_running_location(&[Workspace], true, false, Pref::None),
            Loc::None
        );

        let local_only = RunningLocationClassifier::new(false, false);
        assert_eq!(
            local_only.pick_running_location(&[Workspace], true, false, Pref::None),
            Loc::LocalProcess
        );
    }

    #[test]
    fn test_web_needs_worker_host() {
        let without = RunningLocationClassifier::new(true, false);
        assert_eq!(
            without.pick_running_location(&[Web], true, false, Pref::None),
            Loc::None
        );
        let with = RunningLocationClassifier::new(true, true);
        assert_eq!(
            with.pick_running_location(&[Web], true, false, Pref::None),
            Loc::LocalWebWorker
        );
    }

    #[test]
    fn test_preference_overrides_declaration_order() {
        let classifier = RunningLocationClassifier::new(true, false);
        let kinds = [Workspace, Ui];
        assert_eq!(
            classifier.pick_running_location(&kinds, true, true, Pref::None),
            Loc::Remote
        );
        assert_eq!(
            classifier.pick_running_location(&kinds, true, true, Pref::Local),
            Loc::LocalProcess
        );
        // No compatible candidate: first candidate wins.
        assert_eq!(
            classifier.pick_running_location(&[Workspace], false, true, Pref::Local),
            Loc::Remote
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = RunningLocationClassifier::new(true, true);
        let kinds = [Web, Ui, Workspace];
        for pref in [Pref::None, Pref::Local, Pref::Remote] {
            for (l, r) in [(true, true), (true, false), (false, true), (false, false)] {
                let first = classifier.pick_running_location(&kinds, l, r, pref);
                let second = classifier.pick_running_location(&kinds, l, r, pref);
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn test_default_kind_is_workspace() {
        let classifier = RunningLocationClassifier::new(false, false);
        let desc = local("pub.a", &[]);
        assert_eq!(classifier.get_extension_kind(&desc), vec![Workspace]);
        assert_eq!(classifier.classify(&desc), Loc::LocalProcess);
    }

    #[test]
    fn test_development_kind_override() {
        let classifier =
            RunningLocationClassifier::new(true, true).with_development_kind(Some(vec![Web]));
        let dev = local("pub.dev", &[Ui]).under_development();
        assert_eq!(classifier.get_extension_kind(&dev), vec![Web]);
        assert_eq!(classifier.get_extension_kind(&local("pub.x", &[Ui])), vec![Ui]);
    }

    #[test]
    fn test_development_copy_wins() {
        let classifier = RunningLocationClassifier::new(true, false);
        let kinds = [Workspace, Ui];

        let locations = classifier.determine_running_location(
            &[local("pub.dev", &kinds).under_development()],
            &[remote("pub.dev", &kinds)],
        );
        assert_eq!(locations["pub.dev"], Loc::LocalProcess);

        let locations = classifier.determine_running_location(
            &[local("pub.dev", &kinds)],
            &[remote("pub.dev", &kinds)],
        );
        assert_eq!(locations["pub.dev"], Loc::Remote);
    }
}
