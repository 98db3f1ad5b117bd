//! Tracing setup.

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The default level comes from the
/// configured `log_level` unless CLI verbosity raises it; the `LOG`
/// environment variable takes precedence over both.
pub fn init(verbosity: u8, log_level: &str) {
    let default_level = if verbosity > 0 {
        level_from_verbosity(verbosity)
    } else {
        log_level.parse().unwrap_or(LevelFilter::INFO)
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_from_verbosity(0), LevelFilter::INFO);
        assert_eq!(level_from_verbosity(1), LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(4), LevelFilter::TRACE);
    }
}
