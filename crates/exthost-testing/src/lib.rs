//! Testing utilities for the extension host
//!
//! This crate provides:
//! - A mock extension host and host factory that record every call
//! - In-memory scanner, enablement and workspace services
//! - Description fixtures and an orchestrator harness

pub mod fixtures;
pub mod mock_host;
pub mod mock_services;
pub mod test_utils;

pub use fixtures::{local_extension, remote_extension, HarnessBuilder, TestHarness, REMOTE_AUTHORITY};
pub use mock_host::{MockCall, MockHost, MockHostFactory};
pub use mock_services::{MockEnablement, MockScanner, MockWorkspace};
pub use test_utils::{init_tracing, retry, wait_until};
