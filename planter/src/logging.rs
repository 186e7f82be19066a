//! Development-time tracing for debugging the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of session output.
//!
//! - **Session event log (`io/session_store`)**: Product record in
//!   `<session_dir>/<id>/events.jsonl`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset and `--verbose` is passed.
const VERBOSE_FILTER: &str = "warn,planter=debug";

/// Initialize tracing subscriber for development logging.
///
/// `RUST_LOG` wins when set. Otherwise the filter is `warn`, or
/// [`VERBOSE_FILTER`] when `verbose` is true. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=planter::engine=trace planter solve "count the Rust files"
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .compact(),
        )
        .init();
}
