//! Per-session update-check state: dedup map, error-cache policy, clock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::update::{CheckKind, UpdateCheck};

/// Wall clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System time in milliseconds since the epoch.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// How the session dedup map participates in update checks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// Each `(repository, url, item, kind)` is checked at most once.
    #[default]
    Enabled,
    /// Every call is treated as fresh; nothing is recorded.
    Disabled,
    /// The dedup map is ignored on reads but still written by `touch`.
    Bypass,
}

impl SessionMode {
    /// Parses the configuration string. Legacy `true`/`false` map to
    /// enabled/disabled; anything unrecognized is disabled.
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("enabled") || raw.eq_ignore_ascii_case("true") {
            SessionMode::Enabled
        } else if raw.eq_ignore_ascii_case("bypass") {
            SessionMode::Bypass
        } else {
            SessionMode::Disabled
        }
    }
}

/// Which previously observed fetch errors may be replayed instead of
/// re-fetching.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub cache_not_found: bool,
    pub cache_transfer_error: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct SessionKey {
    repository_id: String,
    url: String,
    item: String,
    kind: CheckKind,
}

impl SessionKey {
    pub(crate) fn of(check: &UpdateCheck) -> Self {
        Self {
            repository_id: check.repository.id.clone(),
            url: check.repository.url.clone(),
            item: check.item.clone(),
            kind: check.kind,
        }
    }
}

/// One resolution session. Checks against the same session share the dedup
/// map; lookups and insertions are O(1) under a single mutex, and no I/O
/// happens while it is held.
pub struct Session {
    mode: SessionMode,
    error_policy: ErrorPolicy,
    clock: Arc<dyn Clock>,
    checked: Mutex<HashSet<SessionKey>>,
}

impl Session {
    pub fn new(mode: SessionMode, error_policy: ErrorPolicy) -> Self {
        Self::with_clock(mode, error_policy, Arc::new(SystemClock))
    }

    pub fn with_clock(mode: SessionMode, error_policy: ErrorPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            mode,
            error_policy,
            clock,
            checked: Mutex::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn is_checked(&self, key: &SessionKey) -> bool {
        self.checked
            .lock()
            .expect("session dedup map poisoned")
            .contains(key)
    }

    pub(crate) fn record(&self, key: SessionKey) {
        self.checked
            .lock()
            .expect("session dedup map poisoned")
            .insert(key);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionMode::default(), ErrorPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(SessionMode::parse("enabled"), SessionMode::Enabled);
        assert_eq!(SessionMode::parse("true"), SessionMode::Enabled);
        assert_eq!(SessionMode::parse("bypass"), SessionMode::Bypass);
        assert_eq!(SessionMode::parse("false"), SessionMode::Disabled);
        assert_eq!(SessionMode::parse("disabled"), SessionMode::Disabled);
        assert_eq!(SessionMode::parse("whatever"), SessionMode::Disabled);
    }
}
