//! Sidecar tracking state for update checks.
//!
//! Artifacts get a `<file>.lastUpdated` properties file next to the artifact;
//! metadata shares a `resolver-status.properties` bag in its directory.
//! Entries are keyed by repository id and normalized URL so that two
//! repositories with colliding URLs stay distinct. The format is plain ASCII
//! `key=value` properties for compatibility with preexisting state.
//!
//! All I/O here is best effort: unreadable or unwritable sidecar state is
//! treated as "nothing recorded" and never surfaces as an error.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::update::{CheckKind, RemoteRepository, UpdateCheck};

const METADATA_TRACKING_FILE: &str = "resolver-status.properties";
const HEADER: &str = "#quarry resolver tracking file, do not edit";

/// What the sidecar knows about a previous check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct TrackingRecord {
    pub last_updated: Option<u64>,
    /// Empty string marks a cached not-found; anything else is the class
    /// name of a cached transfer error.
    pub error: Option<String>,
}

/// Reads the recorded state for this check. Missing or corrupt sidecar
/// state yields an empty record.
pub(crate) fn read(check: &UpdateCheck, file: &Path) -> TrackingRecord {
    let Some(path) = sidecar_path(check, file) else {
        return TrackingRecord::default();
    };
    let Some(props) = read_properties(&path) else {
        return TrackingRecord::default();
    };

    let repo = tracking_repository(check);
    let last_updated = props
        .get(&last_updated_key(repo))
        .and_then(|raw| raw.parse::<u64>().ok());
    let error = props.get(&error_key(repo)).cloned();

    TrackingRecord {
        last_updated,
        error,
    }
}

/// Records the current wall clock and the outcome of the attempt.
pub(crate) fn touch(check: &UpdateCheck, file: &Path, now_ms: u64) {
    let Some(path) = sidecar_path(check, file) else {
        return;
    };
    if let Some(dir) = path.parent()
        && let Err(e) = fs::create_dir_all(dir)
    {
        tracing::warn!(path = %dir.display(), "failed to create tracking dir: {e}");
        return;
    }

    let _lock = SidecarLock::acquire(&path);

    let mut props = read_properties(&path).unwrap_or_default();

    let repo = tracking_repository(check);
    props.insert(last_updated_key(repo), now_ms.to_string());
    match &check.previous_error {
        Some(error) if error.is_not_found() => {
            props.insert(error_key(repo), String::new());
        }
        Some(error) => {
            props.insert(error_key(repo), error.class.clone());
        }
        None => {
            props.remove(&error_key(repo));
        }
    }

    if let Err(e) = write_properties(&path, &props) {
        tracing::warn!(path = %path.display(), "failed to write tracking file: {e}");
    }
}

fn tracking_repository(check: &UpdateCheck) -> &RemoteRepository {
    match check.kind {
        CheckKind::Artifact => &check.repository,
        CheckKind::Metadata => &check.authoritative,
    }
}

fn sidecar_path(check: &UpdateCheck, file: &Path) -> Option<PathBuf> {
    match check.kind {
        CheckKind::Artifact => {
            let name = file.file_name()?;
            let mut name = name.to_os_string();
            name.push(".lastUpdated");
            Some(file.with_file_name(name))
        }
        CheckKind::Metadata => Some(file.parent()?.join(METADATA_TRACKING_FILE)),
    }
}

fn normalize_url(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn last_updated_key(repo: &RemoteRepository) -> String {
    format!("last.updated.{}.{}", repo.id, normalize_url(&repo.url))
}

fn error_key(repo: &RemoteRepository) -> String {
    format!("error.{}.{}", repo.id, normalize_url(&repo.url))
}

// =============================================================================
// Properties codec
// =============================================================================

fn read_properties(path: &Path) -> Option<BTreeMap<String, String>> {
    let contents = fs::read_to_string(path).ok()?;
    let mut props = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
            continue;
        }
        if let Some((key, value)) = parse_entry(line) {
            props.insert(key, value);
        }
    }
    Some(props)
}

fn write_properties(path: &Path, props: &BTreeMap<String, String>) -> io::Result<()> {
    let mut contents = String::new();
    contents.push_str(HEADER);
    contents.push('\n');
    for (key, value) in props {
        contents.push_str(&escape(key, true));
        contents.push('=');
        contents.push_str(&escape(value, false));
        contents.push('\n');
    }

    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("tracking path has no parent directory"))?;
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    fs::write(temp.path(), contents.as_bytes())?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn escape(raw: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut leading = true;
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '=' => out.push_str("\\="),
            ':' => out.push_str("\\:"),
            '#' => out.push_str("\\#"),
            '!' => out.push_str("\\!"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ' ' if is_key || leading => out.push_str("\\ "),
            c => out.push(c),
        }
        if c != ' ' {
            leading = false;
        }
    }
    out
}

fn parse_entry(line: &str) -> Option<(String, String)> {
    let mut key = String::new();
    let mut value = String::new();
    let mut in_key = true;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let target = if in_key { &mut key } else { &mut value };
        if c == '\\' {
            match chars.next() {
                Some('n') => target.push('\n'),
                Some('r') => target.push('\r'),
                Some('t') => target.push('\t'),
                Some(other) => target.push(other),
                None => break,
            }
        } else if in_key && (c == '=' || c == ':') {
            in_key = false;
        } else if in_key && (c == ' ' || c == '\t') {
            // `key value` and `key = value` both separate here
            in_key = false;
            let rest = chars.as_str().trim_start();
            let rest = rest
                .strip_prefix('=')
                .or_else(|| rest.strip_prefix(':'))
                .unwrap_or(rest);
            chars = rest.trim_start().chars();
        } else {
            target.push(c);
        }
    }
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

// =============================================================================
// Sidecar lock
// =============================================================================

/// Advisory lock scoped to one sidecar file, held for the duration of a
/// single read-modify-write. Released on drop, including during unwinding.
struct SidecarLock {
    path: PathBuf,
}

impl SidecarLock {
    fn acquire(sidecar: &Path) -> Option<Self> {
        let mut name = sidecar.file_name()?.to_os_string();
        name.push(".lock");
        let path = sidecar.with_file_name(name);

        for _ in 0..50 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Some(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    maybe_remove_stale_lock(&path);
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "failed to take sidecar lock: {e}");
                    return None;
                }
            }
        }
        tracing::warn!(path = %path.display(), "sidecar lock busy, proceeding without it");
        None
    }
}

impl Drop for SidecarLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn maybe_remove_stale_lock(path: &Path) {
    if let Ok(meta) = fs::metadata(path)
        && let Ok(modified) = meta.modified()
        && let Ok(age) = modified.elapsed()
        && age > Duration::from_secs(10)
    {
        let _ = fs::remove_file(path);
    }
}
