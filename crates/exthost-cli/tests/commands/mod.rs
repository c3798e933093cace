mod classify_test;
mod host_runner_test;
mod run_test;

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

pub const MANIFEST: &str = r#"{
    "extensions": [
        {
            "identifier": "pub.local",
            "version": "1.0.0",
            "activationEvents": ["onFoo"],
            "location": {"scheme": "local", "path": "/ext/local"}
        },
        {
            "identifier": "pub.web",
            "version": "1.0.0",
            "extensionKind": ["web"],
            "location": {"scheme": "local", "path": "/ext/web"}
        },
        {
            "identifier": "pub.lazy",
            "version": "1.0.0",
            "activationEvents": ["onBar"],
            "location": {"scheme": "local", "path": "/ext/lazy"}
        }
    ]
}"#;

/// Write `content` as a manifest file in a fresh directory.
pub fn write_manifest(content: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("extensions.json");
    fs::write(&path, content).unwrap();
    (dir, path)
}
