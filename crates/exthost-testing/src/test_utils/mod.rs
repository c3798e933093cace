//! Async test helpers.

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; silent by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Retry helper for timing-dependent checks
pub async fn retry<R, E, F, Fut>(mut f: F, max_attempts: u32) -> Result<R, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= max_attempts => return Err(e),
            Err(_) => {
                tokio::time::sleep(Duration::from_millis(20 * attempt as u64)).await;
                attempt += 1;
            }
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert with retry logic
#[macro_export]
macro_rules! assert_eventually {
    ($condition:expr $(,)?) => {
        $crate::assert_eventually!($condition, 200)
    };
    ($condition:expr, $max_attempts:expr $(,)?) => {{
        let mut attempts = 0;
        loop {
            match ($condition) {
                true => break,
                false if attempts >= $max_attempts => {
                    panic!(
                        "Condition `{}` did not become true after {} attempts",
                        stringify!($condition),
                        $max_attempts
                    );
                }
                false => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }};
}
