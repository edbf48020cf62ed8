use std::sync::Once;

use tracing::info;
use tracing_subscriber::{
    filter::filter_fn,
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

static TEST_SETUP: Once = Once::new();

/// Install the test log subscriber once per process.
///
/// Level comes from `RUST_LOG`, defaulting to `debug` for this crate. Output
/// goes through the test writer, so it only shows for failing tests or with
/// `--nocapture`.
pub fn init_test_setup() {
    TEST_SETUP.call_once(|| {
        setup_test_logging();
        info!("test logging ready");
    });
}

fn setup_test_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pricetree=debug"));

    let layer = fmt::layer()
        .with_test_writer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(filter_fn(|metadata| !metadata.target().starts_with("config")))
        .with_filter(env_filter);

    // another harness may already own the global subscriber
    if let Err(e) = tracing_subscriber::registry().with(layer).try_init() {
        eprintln!("test logging not installed: {}", e);
    }
}
