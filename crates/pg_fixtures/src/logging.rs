//! Tracing setup for test binaries

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::FixtureError;

/// Installs a tracing subscriber that writes through the test harness
///
/// `RUST_LOG` wins over `log_level`; an unparsable level falls back to `info`.
/// Calling this more than once is harmless, later calls leave the first
/// subscriber in place.
pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_test_writer(),
        )
        .try_init();
}

/// Reports a fatal fixture error and exits the test process
///
/// Used for failures that make every test meaningless, such as a missing
/// database address, so the run stops once instead of failing each test.
/// The exit status comes from [`FixtureError::exit_code`].
pub fn abort_run(error: &FixtureError) -> ! {
    let code = error.exit_code();
    tracing::error!(%error, code, "Aborting test run");
    eprintln!("pg_fixtures: aborting test run: {}", error);
    std::process::exit(code)
}
