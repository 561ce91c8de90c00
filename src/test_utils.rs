//! Test utilities and global setup

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG` with sensible defaults and uses the test writer
    /// so log lines do not interfere with test output.
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Default filter: debug for our crate, info for noisy dependencies
                EnvFilter::new("debug,tokio=info,hyper=info,h2=info,tower=info")
            });

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Global test logging setup
///
/// Add this to any test module where you want automatic logging
/// initialization when running with `--features test-logging`.
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Binary used by server integration tests
///
/// Checks the `LSP_SERVER_PATH` environment variable and falls back to
/// "pyright-langserver", so tests work both in CI and local development.
#[cfg(all(test, feature = "server-integration-tests"))]
pub fn integration_server_path() -> String {
    std::env::var("LSP_SERVER_PATH").unwrap_or_else(|_| "pyright-langserver".to_string())
}
