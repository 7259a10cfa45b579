//! Logging.
//!
//! Loops, sessions and services log through the macros re-exported here,
//! with structured fields (`session = %id`, `fd`, `service`). With the
//! `tracing` feature off they expand to nothing, so call sites use them as
//! statements only.

/// Filter used when `RUST_LOG` is unset.
#[cfg(feature = "tracing")]
const DEFAULT_FILTER: &str = "conduit=trace";

/// Installs a `fmt` subscriber for the process.
///
/// Loop threads are named after their loop, so the thread name column
/// tells which loop logged a line. Later calls are ignored, which lets
/// every test call this. Without the `tracing` feature it does nothing.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let layer = fmt::layer()
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(fmt::time::uptime());

    // Err means a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
