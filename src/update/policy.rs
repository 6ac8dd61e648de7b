//! Update policies (staleness evaluation).

use time::{OffsetDateTime, Time, UtcOffset};

/// How stale a cached file may get before a remote check is required.
///
/// Parsed from the per-repository policy string; an unrecognized string
/// behaves like `never`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdatePolicy {
    Always,
    Never,
    Daily,
    /// Interval in minutes.
    Interval(u32),
    Unknown(String),
}

pub const POLICY_ALWAYS: &str = "always";
pub const POLICY_NEVER: &str = "never";
pub const POLICY_DAILY: &str = "daily";
pub const POLICY_INTERVAL: &str = "interval";

const DEFAULT_INTERVAL_MINUTES: u32 = 1440;

impl UpdatePolicy {
    pub fn parse(raw: &str) -> Self {
        if raw == POLICY_ALWAYS {
            UpdatePolicy::Always
        } else if raw == POLICY_NEVER {
            UpdatePolicy::Never
        } else if raw == POLICY_DAILY {
            UpdatePolicy::Daily
        } else if raw == POLICY_INTERVAL {
            UpdatePolicy::Interval(DEFAULT_INTERVAL_MINUTES)
        } else if let Some(minutes) = raw.strip_prefix("interval:") {
            match minutes.parse::<u32>() {
                Ok(minutes) => UpdatePolicy::Interval(minutes),
                Err(_) => UpdatePolicy::Unknown(raw.to_string()),
            }
        } else {
            UpdatePolicy::Unknown(raw.to_string())
        }
    }

    /// Whether this policy never triggers an update from staleness alone.
    /// Unrecognized policy strings behave like `never`.
    pub fn is_never(&self) -> bool {
        matches!(self, UpdatePolicy::Never | UpdatePolicy::Unknown(_))
    }

    /// Whether a file last checked at `last_updated_ms` is stale at `now_ms`.
    pub fn is_stale(&self, last_updated_ms: u64, now_ms: u64) -> bool {
        match self {
            UpdatePolicy::Always => true,
            UpdatePolicy::Never => false,
            UpdatePolicy::Daily => last_updated_ms < start_of_day_ms(now_ms),
            UpdatePolicy::Interval(minutes) => {
                now_ms.saturating_sub(last_updated_ms) >= u64::from(*minutes) * 60_000
            }
            UpdatePolicy::Unknown(raw) => {
                tracing::warn!(policy = %raw, "unknown update policy, assuming never");
                false
            }
        }
    }
}

/// Millisecond timestamp of the current day's local midnight.
fn start_of_day_ms(now_ms: u64) -> u64 {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let now = OffsetDateTime::from_unix_timestamp_nanos(i128::from(now_ms) * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .to_offset(offset);
    let midnight = now.replace_time(Time::MIDNIGHT);
    let ms = midnight.unix_timestamp_nanos() / 1_000_000;
    if ms < 0 { 0 } else { ms as u64 }
}
