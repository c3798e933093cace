//! Extension lists read from a JSON manifest file.

use std::path::Path;

use anyhow::{Context, Result};
use exthost_core::prelude::*;
use serde::Deserialize;

/// Descriptions listed in a manifest file.
///
/// Accepts either `{"extensions": [...]}` or a bare array of descriptions.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub extensions: Vec<ExtensionDescription>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Wrapped { extensions: Vec<ExtensionDescription> },
    Bare(Vec<ExtensionDescription>),
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let extensions = match serde_json::from_str::<ManifestFile>(content)? {
            ManifestFile::Wrapped { extensions } | ManifestFile::Bare(extensions) => extensions,
        };
        Ok(Self { extensions })
    }

    pub fn has_remote(&self) -> bool {
        self.extensions.iter().any(ExtensionDescription::is_remote)
    }
}

/// Scanner serving a fixed manifest.
pub struct ManifestScanner {
    manifest: Manifest,
}

impl ManifestScanner {
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }
}

#[async_trait::async_trait]
impl ExtensionScanner for ManifestScanner {
    async fn scan_installed(&self) -> exthost_core::Result<Vec<ExtensionDescription>> {
        Ok(self.manifest.extensions.clone())
    }

    async fn resolve(
        &self,
        handle: &ExtensionHandle,
    ) -> exthost_core::Result<Option<ExtensionDescription>> {
        Ok(self
            .manifest
            .extensions
            .iter()
            .find(|desc| {
                desc.identifier == handle.identifier && desc.location.same_side(&handle.location)
            })
            .cloned())
    }
}
