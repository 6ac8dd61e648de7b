//! Daemon configuration (defaults, environment, CLI overrides).
//!
//! There is no config file: the lock daemon is configured through
//! environment variables and command-line flags, applied in that order on
//! top of the defaults.

use std::time::Duration;

use crate::ipc::SocketFamily;

pub const ENV_IDLE_TIMEOUT: &str = "QUARRY_IPC_IDLE_TIMEOUT";
pub const ENV_FAMILY: &str = "QUARRY_IPC_FAMILY";
pub const ENV_NO_FORK: &str = "QUARRY_IPC_NO_FORK";
pub const ENV_DEBUG: &str = "QUARRY_IPC_DEBUG";

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Lock daemon settings, plumbed through constructors rather than read from
/// globals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcConfig {
    /// Grace period before auto-shutdown when idle with no clients.
    pub idle_timeout: Duration,
    /// Socket family the daemon binds.
    pub family: SocketFamily,
    /// Run the daemon on an in-process thread instead of spawning.
    pub no_fork: bool,
    /// Per-request debug logging.
    pub debug: bool,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            family: SocketFamily::Unix,
            no_fork: false,
            debug: false,
        }
    }
}

impl IpcConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        apply_env_overrides(&mut cfg);
        cfg
    }
}

pub fn apply_env_overrides(cfg: &mut IpcConfig) {
    if let Ok(raw) = std::env::var(ENV_IDLE_TIMEOUT) {
        match parse_timeout(&raw) {
            Some(timeout) => cfg.idle_timeout = timeout,
            None => tracing::warn!(value = %raw, "invalid {ENV_IDLE_TIMEOUT}, keeping default"),
        }
    }
    if let Ok(raw) = std::env::var(ENV_FAMILY) {
        match SocketFamily::parse(&raw) {
            Some(family) => cfg.family = family,
            None => tracing::warn!(value = %raw, "invalid {ENV_FAMILY}, keeping default"),
        }
    }
    if let Ok(raw) = std::env::var(ENV_NO_FORK) {
        cfg.no_fork = parse_bool(&raw);
    }
    if let Ok(raw) = std::env::var(ENV_DEBUG) {
        cfg.debug = parse_bool(&raw);
    }
}

/// Parses a timeout given as integer seconds or with an `ms` suffix.
pub fn parse_timeout(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(millis) = raw.strip_suffix("ms") {
        millis.parse::<u64>().ok().map(Duration::from_millis)
    } else {
        raw.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn parse_bool(raw: &str) -> bool {
    raw.trim().eq_ignore_ascii_case("true") || raw.trim() == "1"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_parsing() {
        assert_eq!(parse_timeout("300"), Some(Duration::from_secs(300)));
        assert_eq!(parse_timeout("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout(" 1s"), None);
        assert_eq!(parse_timeout("soon"), None);
    }

    #[test]
    fn defaults_match_contract() {
        let cfg = IpcConfig::default();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.family, SocketFamily::Unix);
        assert!(!cfg.no_fork);
        assert!(!cfg.debug);
    }
}
