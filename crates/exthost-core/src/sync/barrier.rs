//! One-shot gate.

use std::sync::Arc;

use tokio::sync::watch;

/// A gate that starts closed and stays open forever once opened.
///
/// Clones share the same gate.
#[derive(Clone)]
pub struct Barrier {
    tx: Arc<watch::Sender<bool>>,
}

impl Barrier {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Open the gate. Opening twice is a no-op.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open. Returns at once if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("open", &self.is_open())
            .finish()
    }
}
