//! Tracing infrastructure for pullstream.
//!
//! Enabled by the default `tracing` feature. With the feature off every
//! logging macro expands to nothing, so the hot read/write paths carry no
//! logging cost.

/// Installs a `tracing-subscriber` registry with uptime timestamps.
///
/// Call this once at the start of a binary or test. The filter comes from
/// `RUST_LOG` and falls back to `pullstream=trace`. Does nothing if the
/// `tracing` feature is disabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pullstream=trace"));

    // A host application may already own the global subscriber.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, info, trace, warn};

// Without the feature every level shares one macro that drops its input.
#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {discard as debug, discard as info, discard as trace, discard as warn};
