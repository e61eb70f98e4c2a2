use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self},
    prelude::*,
};

use crate::ServerError;

/// Map a `-v` count to a level: 0 warn, 1 info, 2 debug, more trace.
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber: compact lines on stderr.
///
/// Fails instead of panicking if a global subscriber is already set, so an
/// embedding application keeps its own.
pub fn init_logging(level: LevelFilter) -> Result<(), ServerError> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(level)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| ServerError::Logging(e.to_string()))
}
