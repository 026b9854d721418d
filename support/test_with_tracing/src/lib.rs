// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test attribute that routes `tracing` output to the test harness.
//!
//! Output is captured per test and shown only for failing tests. The filter
//! comes from `RUST_LOG` and defaults to `debug`.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

#[doc(hidden)]
/// Initializes `tracing` for tests.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::DEBUG.into())
            .from_env_lossy();
        // Another harness may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_thread_names(true)
            .with_env_filter(filter)
            .try_init();
    });
}

#[doc(hidden)]
/// Runs an async test body to completion on the current thread.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    futures::executor::block_on(fut)
}

#[cfg(test)]
mod tests {
    use super::test;

    #[test]
    fn sync_test() {
        tracing::info!("visible on failure");
    }

    #[test]
    fn test_with_return() -> Result<(), Box<dyn std::error::Error>> {
        tracing::debug!(value = 1, "ok");
        Ok(())
    }

    #[test]
    async fn async_test() {
        let value = async { 7 }.await;
        assert_eq!(value, 7);
    }
}
