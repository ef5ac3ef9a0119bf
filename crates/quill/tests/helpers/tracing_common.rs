use tracing::Level;
use tracing_subscriber::{filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

/// What gets logged when `RUST_LOG` is unset or doesn't parse
fn default_targets() -> Targets {
    Targets::new().with_default(Level::INFO).with_targets([
        ("quill", Level::DEBUG),
        ("quill_h2", Level::DEBUG),
        ("quill_hpack", Level::INFO),
    ])
}

/// Every test calls this, the first one in a test binary installs the
/// subscriber.
pub(crate) fn setup_tracing() {
    let targets = std::env::var("RUST_LOG")
        .ok()
        .and_then(|filter| filter.parse::<Targets>().ok())
        .unwrap_or_else(default_targets);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_test_writer();

    let _ = tracing_subscriber::registry()
        .with(targets)
        .with(fmt_layer)
        .try_init();
}
