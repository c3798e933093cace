//! Synchronization primitives used by the orchestrator.

pub mod barrier;
pub mod lock;

pub use barrier::Barrier;
pub use lock::{Lock, LockGuard};
