//! Process-wide logging setup for courier services.

pub mod logging;

pub use logging::{LogConfig, LogFormat};

/// JSON logs filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init() {
    logging::init(&LogConfig::default());
}

/// Install a subscriber from an explicit configuration.
pub fn init_with(config: &LogConfig) {
    logging::init(config);
}

/// Compact logs routed through the test harness's captured output.
pub fn init_for_tests() {
    logging::init_for_tests();
}
