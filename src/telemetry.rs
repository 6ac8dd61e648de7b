//! Tracing initialization for the CLI and the daemon.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `QUARRY_LOG` overrides the verbosity
/// derived from repeated `-v` flags. Safe to call more than once; later
/// calls are no-ops.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_env("QUARRY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "quarry=info",
        1 => "quarry=debug",
        _ => "quarry=trace",
    }
}
