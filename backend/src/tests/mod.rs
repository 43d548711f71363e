pub mod unit;
pub mod integration;
pub mod helpers;

// Common test utilities and shared test setup
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route engine logs through the test writer so `--nocapture` shows them per test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
