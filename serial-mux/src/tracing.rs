//! Provide tracing, tailored to this program.
//!
//! At startup, the program should call one of the init_* functions at startup
//! to install a tracing subscriber (i.e., something that emits events to a
//! log).
//!
//! The rest of program the can include `use tracing::prelude::*` for convenient
//! access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()`
//! macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging at the default level (INFO).
///
/// If running under systemd, use journald; otherwise fall
/// back to stdout.
pub fn init_journald_or_stdout() {
    init_with_level(LevelFilter::INFO);
}

/// Initialize logging, using `debug` to choose DEBUG over INFO as the level
/// applied when RUST_LOG is unset.
///
/// Per-message TX/RX lines are only emitted at DEBUG.
pub fn init_with_debug(debug: bool) {
    init_with_level(if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    });
}

fn init_with_level(default_level: LevelFilter) {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(default_level)
                .with(layer)
                .init();
        } else {
            use_stdout(default_level);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(default_level);
    }
}

// Log to stdout, filtering according to environment variable RUST_LOG and
// falling back to `default_level` for targets it doesn't mention.
fn use_stdout(default_level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Timestamps in local time to the nearest second; the default timer prints
// long UTC strings.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
