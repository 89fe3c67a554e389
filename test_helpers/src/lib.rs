//! Utilities shared by the workspace's test suites.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing;
use parking_lot::Once;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "future_timeout")]
pub mod timeout;

/// Start logging if the `RUST_LOG` environment variable is set.
///
/// Tests call this at the top so that failures come with the engine's
/// structured log output. Safe to call any number of times.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Enables debug logging for the test process regardless of environment.
pub fn start_logging() {
    static LOG_SETUP: Once = Once::new();

    // ensure the global logger is only initialized once
    LOG_SETUP.call_once(|| {
        // capture log records as tracing events
        tracing_log::LogTracer::init().expect("log tracer init");

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("subscriber set");
    });
}

#[macro_export]
/// A macro to assert that one string is contained within another with
/// a nice error message if they are not.
macro_rules! assert_contains {
    ($actual: expr, $expected: expr) => {
        let actual_value: String = $actual.to_string();
        let expected_value: String = $expected.to_string();
        assert!(
            actual_value.contains(&expected_value),
            "Can not find expected in actual.\n\nExpected:\n{}\n\nActual:\n{}",
            expected_value,
            actual_value
        );
    };
}
