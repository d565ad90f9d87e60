//! # test
//! Helpers for tests of the backup crates.
//!

use std::{io, sync::OnceLock};

use tracing::{Level, subscriber::set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, registry};

static TEST_LOGGER: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Create and set the global logger for tests.
///
/// Safe to call from every test in a binary, only the first call installs the subscriber.
pub fn init_test_logger() {
    TEST_LOGGER.get_or_init(|| {
        let filter = tracing_subscriber::filter::Targets::new().with_default(Level::TRACE);

        // Std layer
        let (std_guard, std_layer) = {
            let (writer, guard) = tracing_appender::non_blocking(io::stdout());

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(true)
                .with_target(false);

            (guard, layer)
        };

        // Create registry
        let registry = registry().with(std_layer).with(filter);

        // Another harness may already own the global subscriber.
        set_global_default(registry).ok().map(|()| std_guard)
    });
}
