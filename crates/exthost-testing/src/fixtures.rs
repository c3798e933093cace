//! Description fixtures and a ready-wired orchestrator harness.

use std::sync::Arc;

use exthost_core::prelude::*;

use crate::mock_host::{MockHost, MockHostFactory};
use crate::mock_services::{MockEnablement, MockScanner, MockWorkspace};

/// Authority used for remote fixtures.
pub const REMOTE_AUTHORITY: &str = "ssh-remote+test";

/// A local extension at `/ext/<id>`, version 1.0.0.
pub fn local_extension(id: &str) -> ExtensionDescription {
    ExtensionDescription::new(
        id,
        semver::Version::new(1, 0, 0),
        ExtensionLocation::local(format!("/ext/{id}")),
    )
}

/// A remote extension at `/ext/<id>` on [`REMOTE_AUTHORITY`].
pub fn remote_extension(id: &str) -> ExtensionDescription {
    ExtensionDescription::new(
        id,
        semver::Version::new(1, 0, 0),
        ExtensionLocation::remote(REMOTE_AUTHORITY, format!("/ext/{id}")),
    )
}

/// Orchestrator wired to mock collaborators.
pub struct TestHarness {
    pub orchestrator: ExtensionOrchestrator,
    pub scanner: Arc<MockScanner>,
    pub factory: Arc<MockHostFactory>,
    pub enablement: Arc<MockEnablement>,
    pub workspace: Arc<MockWorkspace>,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Latest mock host of `kind`.
    ///
    /// # Panics
    ///
    /// When no host of that kind was created.
    pub fn host(&self, kind: ExtensionHostKind) -> Arc<MockHost> {
        self.factory
            .host(kind)
            .unwrap_or_else(|| panic!("no {kind} host was created"))
    }

    pub fn local_host(&self) -> Arc<MockHost> {
        self.host(ExtensionHostKind::LocalProcess)
    }

    pub fn remote_host(&self) -> Arc<MockHost> {
        self.host(ExtensionHostKind::Remote)
    }

    /// Make `desc` installable and return its handle.
    pub fn install(&self, desc: ExtensionDescription) -> ExtensionHandle {
        let handle = desc.handle();
        self.scanner.install(desc);
        handle
    }
}

#[derive(Default)]
pub struct HarnessBuilder {
    config: OrchestratorConfig,
    installed: Vec<ExtensionDescription>,
}

impl HarnessBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_remote_host(mut self) -> Self {
        self.config = self.config.with_remote_host(true);
        self
    }

    pub fn with_web_worker_host(mut self) -> Self {
        self.config = self.config.with_web_worker_host(true);
        self
    }

    pub fn dev_host(mut self) -> Self {
        self.config = self.config.with_dev_host(true);
        self
    }

    pub fn installed(mut self, descriptions: impl IntoIterator<Item = ExtensionDescription>) -> Self {
        self.installed.extend(descriptions);
        self
    }

    /// Host kinds the config asks for; the local process host always exists.
    fn kinds(&self) -> Vec<ExtensionHostKind> {
        let mut kinds = vec![ExtensionHostKind::LocalProcess];
        if self.config.has_web_worker_host {
            kinds.push(ExtensionHostKind::LocalWebWorker);
        }
        if self.config.has_remote_host {
            kinds.push(ExtensionHostKind::Remote);
        }
        kinds
    }

    /// Wire everything up without initializing.
    pub fn build(self) -> TestHarness {
        crate::init_tracing();
        let scanner = Arc::new(MockScanner::new().with_installed(self.installed.clone()));
        let factory = Arc::new(MockHostFactory::new(self.kinds()));
        let enablement = Arc::new(MockEnablement::new());
        let workspace = Arc::new(MockWorkspace::new());

        let orchestrator = ExtensionOrchestrator::builder(scanner.clone(), factory.clone())
            .config(self.config)
            .enablement(enablement.clone())
            .workspace(workspace.clone())
            .build();

        TestHarness {
            orchestrator,
            scanner,
            factory,
            enablement,
            workspace,
        }
    }

    /// Build and initialize.
    pub async fn start(self) -> TestHarness {
        let harness = self.build();
        harness
            .orchestrator
            .initialize()
            .await
            .unwrap_or_else(|e| panic!("initialize failed: {e}"));
        harness
    }
}
