//! Update-check decisions for cached artifacts and metadata.
//!
//! The engine answers one question: given a locally cached file, its
//! repository and an update policy, must the caller re-fetch? It never
//! performs network I/O itself; it combines the policy, the sidecar
//! tracking state and the session dedup map into a decision, optionally
//! replaying a previously cached fetch error.

mod policy;
mod session;
mod tracking;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub use policy::{POLICY_ALWAYS, POLICY_DAILY, POLICY_INTERVAL, POLICY_NEVER, UpdatePolicy};
pub use session::{Clock, ErrorPolicy, Session, SessionMode, SystemClock};

use session::SessionKey;

/// What is being checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Artifact,
    Metadata,
}

/// A remote repository, reduced to what the engine keys on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteRepository {
    pub id: String,
    pub url: String,
}

impl RemoteRepository {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

/// Kind of a cached fetch failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachedErrorKind {
    NotFound,
    Transfer,
}

/// A fetch failure observed earlier, possibly replayed from the sidecar
/// instead of retrying the remote.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CachedError {
    pub kind: CachedErrorKind,
    /// Class name persisted in the sidecar (empty marker for not-found).
    pub class: String,
    pub message: String,
    /// True when this instance was rebuilt from the sidecar rather than
    /// observed on this attempt.
    pub from_cache: bool,
}

impl CachedError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: CachedErrorKind::NotFound,
            class: String::new(),
            message: message.into(),
            from_cache: false,
        }
    }

    pub fn transfer(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: CachedErrorKind::Transfer,
            class: class.into(),
            message: message.into(),
            from_cache: false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CachedErrorKind::NotFound
    }
}

/// Caller error: the check is malformed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpdateCheckError {
    #[error("update check for `{item}` has no local file attached")]
    MissingFile { item: String },
}

/// One update-check request and its outcome.
///
/// `required` and `exception` are outputs; everything else is caller input.
#[derive(Clone, Debug)]
pub struct UpdateCheck {
    pub item: String,
    pub kind: CheckKind,
    pub file: Option<PathBuf>,
    /// Effective repository the fetch would go to.
    pub repository: RemoteRepository,
    /// Authoritative repository the item belongs to (metadata tracking keys
    /// on this one).
    pub authoritative: RemoteRepository,
    pub policy: String,
    /// Last remote-check timestamp known to the caller, ms since epoch.
    pub local_last_updated: Option<u64>,
    pub file_valid: bool,
    /// Outcome of the previous fetch attempt, persisted by [`UpdateCheckManager::touch`].
    pub previous_error: Option<CachedError>,
    pub required: bool,
    pub exception: Option<CachedError>,
}

impl UpdateCheck {
    pub fn artifact(item: impl Into<String>, file: PathBuf, repository: RemoteRepository) -> Self {
        Self::new(item, CheckKind::Artifact, file, repository)
    }

    pub fn metadata(item: impl Into<String>, file: PathBuf, repository: RemoteRepository) -> Self {
        Self::new(item, CheckKind::Metadata, file, repository)
    }

    fn new(
        item: impl Into<String>,
        kind: CheckKind,
        file: PathBuf,
        repository: RemoteRepository,
    ) -> Self {
        Self {
            item: item.into(),
            kind,
            file: Some(file),
            authoritative: repository.clone(),
            repository,
            policy: POLICY_NEVER.to_string(),
            local_last_updated: None,
            file_valid: true,
            previous_error: None,
            required: false,
            exception: None,
        }
    }
}

impl fmt::Display for UpdateCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} < {}", self.item, self.repository.url)
    }
}

/// The decision engine. Stateless; all state lives in the [`Session`] and
/// the sidecar files.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpdateCheckManager;

impl UpdateCheckManager {
    pub fn new() -> Self {
        Self
    }

    /// Decides whether `check` requires a remote fetch, writing the decision
    /// into `check.required` and a replayed error (if any) into
    /// `check.exception`.
    pub fn check(&self, session: &Session, check: &mut UpdateCheck) -> Result<(), UpdateCheckError> {
        let file = check.file.clone().ok_or_else(|| UpdateCheckError::MissingFile {
            item: check.item.clone(),
        })?;

        let record = tracking::read(check, &file);

        // Session dedup: in enabled mode each key is checked at most once.
        let key = SessionKey::of(check);
        if session.mode() == SessionMode::Enabled && session.is_checked(&key) {
            tracing::debug!(item = %check.item, "skipped update check, already checked this session");
            check.required = false;
            check.exception = replay(&record, check);
            return Ok(());
        }

        let policy = UpdatePolicy::parse(&check.policy);
        let file_exists = check.file_valid && file.exists();
        let last_updated = record.last_updated.or(check.local_last_updated);

        if !file_exists {
            // Replay a cached failure instead of re-fetching, when allowed.
            if let Some(error) = replay(&record, check) {
                let cacheable = match error.kind {
                    CachedErrorKind::NotFound => session.error_policy().cache_not_found,
                    CachedErrorKind::Transfer => session.error_policy().cache_transfer_error,
                };
                if cacheable {
                    tracing::debug!(item = %check.item, "replaying cached error for absent file");
                    check.required = false;
                    check.exception = Some(error);
                    return Ok(());
                }
            }
            // A missing file forces a fetch whatever the policy says, unless
            // the policy is `never` (or unrecognized, which behaves like
            // `never`) and nothing was ever recorded.
            check.required = !(policy.is_never() && last_updated.is_none());
            check.exception = None;
        } else {
            check.required = match last_updated {
                None => true,
                Some(ts) => policy.is_stale(ts, session.now_ms()),
            };
            check.exception = None;
        }

        Ok(())
    }

    /// Persists the outcome of a fetch attempt: stamps the sidecar with the
    /// current wall clock and the outcome error, and records the session key
    /// (except in disabled mode).
    pub fn touch(&self, session: &Session, check: &UpdateCheck) -> Result<(), UpdateCheckError> {
        let file = check.file.clone().ok_or_else(|| UpdateCheckError::MissingFile {
            item: check.item.clone(),
        })?;

        if session.mode() != SessionMode::Disabled {
            session.record(SessionKey::of(check));
        }
        tracking::touch(check, &file, session.now_ms());
        Ok(())
    }
}

fn replay(record: &tracking::TrackingRecord, check: &UpdateCheck) -> Option<CachedError> {
    record.error.as_ref().map(|class| {
        if class.is_empty() {
            CachedError {
                kind: CachedErrorKind::NotFound,
                class: String::new(),
                message: format!(
                    "{} was not found in {} during a previous attempt",
                    check.item, check.repository.url
                ),
                from_cache: true,
            }
        } else {
            CachedError {
                kind: CachedErrorKind::Transfer,
                class: class.clone(),
                message: format!(
                    "{} failed to transfer from {} during a previous attempt ({class})",
                    check.item, check.repository.url
                ),
                from_cache: true,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    const MINUTE: u64 = 60_000;
    const NOW: u64 = 1_700_000_000_000;

    struct ManualClock(AtomicU64);

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        manager: UpdateCheckManager,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().expect("tempdir"),
                manager: UpdateCheckManager::new(),
                clock: Arc::new(ManualClock(AtomicU64::new(NOW))),
            }
        }

        fn session(&self, mode: SessionMode, error_policy: ErrorPolicy) -> Session {
            Session::with_clock(mode, error_policy, self.clock.clone())
        }

        fn check_with_file(&self, policy: &str) -> UpdateCheck {
            let file = self.dir.path().join("artifact.txt");
            std::fs::write(&file, b"artifact").expect("write artifact");
            let mut check = UpdateCheck::artifact(
                "gid:aid:1.0",
                file,
                RemoteRepository::new("central", "https://repo.example/maven2/"),
            );
            check.policy = policy.to_string();
            check
        }

        fn check_without_file(&self, policy: &str) -> UpdateCheck {
            let mut check = UpdateCheck::artifact(
                "gid:aid:1.0",
                self.dir.path().join("absent.txt"),
                RemoteRepository::new("central", "https://repo.example/maven2/"),
            );
            check.policy = policy.to_string();
            check
        }
    }

    #[test]
    fn missing_file_field_is_a_precondition_violation() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Enabled, ErrorPolicy::default());
        let mut check = fixture.check_with_file(POLICY_ALWAYS);
        check.file = None;
        assert!(matches!(
            fixture.manager.check(&session, &mut check),
            Err(UpdateCheckError::MissingFile { .. })
        ));
    }

    #[test]
    fn always_then_session_dedup() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Enabled, ErrorPolicy::default());

        let mut check = fixture.check_with_file(POLICY_ALWAYS);
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(check.required);
        assert_eq!(check.exception, None);

        fixture.manager.touch(&session, &check).expect("touch");

        let mut second = fixture.check_with_file(POLICY_ALWAYS);
        fixture.manager.check(&session, &mut second).expect("check");
        assert!(!second.required);
    }

    #[test]
    fn repeated_checks_are_stable_without_touch() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Enabled, ErrorPolicy::default());

        for _ in 0..3 {
            let mut check = fixture.check_with_file(POLICY_ALWAYS);
            fixture.manager.check(&session, &mut check).expect("check");
            assert!(check.required);
        }
    }

    #[test]
    fn bypass_mode_ignores_dedup_reads() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Bypass, ErrorPolicy::default());

        let mut check = fixture.check_with_file(POLICY_ALWAYS);
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(check.required);
        fixture.manager.touch(&session, &check).expect("touch");

        // policy still evaluated even though the key was recorded
        let mut second = fixture.check_with_file(POLICY_ALWAYS);
        fixture.manager.check(&session, &mut second).expect("check");
        assert!(second.required);
    }

    #[test]
    fn interval_staleness_against_local_timestamp() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Disabled, ErrorPolicy::default());

        let mut check = fixture.check_with_file("interval:60");
        check.local_last_updated = Some(NOW - 59 * MINUTE);
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(!check.required);

        check.local_last_updated = Some(NOW - 61 * MINUTE);
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(check.required);
    }

    #[test]
    fn present_file_never_checked_requires_update() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Disabled, ErrorPolicy::default());

        let mut check = fixture.check_with_file(POLICY_DAILY);
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(check.required);
    }

    #[test]
    fn absent_file_with_cached_not_found_replays() {
        let fixture = Fixture::new();
        let session = fixture.session(
            SessionMode::Disabled,
            ErrorPolicy {
                cache_not_found: true,
                cache_transfer_error: false,
            },
        );

        let mut check = fixture.check_without_file(POLICY_NEVER);
        check.previous_error = Some(CachedError::not_found("missing upstream"));
        fixture.manager.touch(&session, &check).expect("touch");

        let mut second = fixture.check_without_file(POLICY_NEVER);
        fixture.manager.check(&session, &mut second).expect("check");
        assert!(!second.required);
        let error = second.exception.expect("replayed error");
        assert!(error.is_not_found());
        assert!(error.from_cache);
    }

    #[test]
    fn absent_file_with_uncached_not_found_requires_update() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Disabled, ErrorPolicy::default());

        let mut check = fixture.check_without_file(POLICY_NEVER);
        check.previous_error = Some(CachedError::not_found("missing upstream"));
        fixture.manager.touch(&session, &check).expect("touch");

        let mut second = fixture.check_without_file(POLICY_NEVER);
        fixture.manager.check(&session, &mut second).expect("check");
        assert!(second.required);
        assert_eq!(second.exception, None);
    }

    #[test]
    fn absent_file_with_cached_transfer_error_replays() {
        let fixture = Fixture::new();
        let session = fixture.session(
            SessionMode::Disabled,
            ErrorPolicy {
                cache_not_found: false,
                cache_transfer_error: true,
            },
        );

        let mut check = fixture.check_without_file(POLICY_DAILY);
        check.previous_error = Some(CachedError::transfer("ChecksumFailure", "bad checksum"));
        fixture.manager.touch(&session, &check).expect("touch");

        let mut second = fixture.check_without_file(POLICY_DAILY);
        fixture.manager.check(&session, &mut second).expect("check");
        assert!(!second.required);
        let error = second.exception.expect("replayed error");
        assert_eq!(error.class, "ChecksumFailure");
        assert!(error.from_cache);
    }

    #[test]
    fn absent_file_with_never_and_no_record_is_not_required() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Disabled, ErrorPolicy::default());

        let mut check = fixture.check_without_file(POLICY_NEVER);
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(!check.required);
    }

    #[test]
    fn absent_file_with_unknown_policy_and_no_record_is_not_required() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Disabled, ErrorPolicy::default());

        // an unrecognized policy behaves like `never` here too
        let mut check = fixture.check_without_file("no particular policy");
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(!check.required);

        // but once a timestamp is on record, the fetch is forced
        fixture.manager.touch(&session, &check).expect("touch");
        let mut second = fixture.check_without_file("no particular policy");
        fixture.manager.check(&session, &mut second).expect("check");
        assert!(second.required);
    }

    #[test]
    fn absent_file_forces_update_regardless_of_policy() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Disabled, ErrorPolicy::default());

        for policy in [POLICY_ALWAYS, POLICY_DAILY, "interval:999999"] {
            let mut check = fixture.check_without_file(policy);
            fixture.manager.check(&session, &mut check).expect("check");
            assert!(check.required, "policy {policy} should require update");
        }
    }

    #[test]
    fn invalid_file_is_treated_as_absent() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Disabled, ErrorPolicy::default());

        let mut check = fixture.check_with_file("interval:999999");
        check.file_valid = false;
        fixture.manager.check(&session, &mut check).expect("check");
        assert!(check.required);
    }

    #[test]
    fn dedup_hit_replays_recorded_error() {
        let fixture = Fixture::new();
        let session = fixture.session(SessionMode::Enabled, ErrorPolicy::default());

        let mut check = fixture.check_without_file(POLICY_ALWAYS);
        check.previous_error = Some(CachedError::transfer("Timeout", "timed out"));
        fixture.manager.touch(&session, &check).expect("touch");

        let mut second = fixture.check_without_file(POLICY_ALWAYS);
        fixture.manager.check(&session, &mut second).expect("check");
        assert!(!second.required);
        assert_eq!(second.exception.expect("error").class, "Timeout");
    }
}
