//! Runtime directory helpers for the lock daemon socket and metadata.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Returns a private runtime directory, creating it if needed.
///
/// Uses `QUARRY_RUNTIME_DIR` if set, otherwise `$XDG_RUNTIME_DIR/quarry`,
/// `~/.quarry`, then a per-user tmp directory.
pub(crate) fn ensure_runtime_dir() -> io::Result<PathBuf> {
    let mut last_err: Option<io::Error> = None;
    for dir in runtime_dir_candidates() {
        match fs::create_dir_all(&dir) {
            Ok(()) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = fs::metadata(&dir)?.permissions().mode() & 0o777;
                    if mode != 0o700 {
                        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
                    }
                }
                return Ok(dir);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err
        .unwrap_or_else(|| io::Error::other("unable to create a writable runtime directory")))
}

fn runtime_dir_candidates() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(dir) = std::env::var("QUARRY_RUNTIME_DIR")
        && !dir.trim().is_empty()
    {
        dirs.push(PathBuf::from(dir));
        return dirs;
    }
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR")
        && !dir.trim().is_empty()
    {
        dirs.push(PathBuf::from(dir).join("quarry"));
    }
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".quarry"));
    }
    dirs.push(per_user_tmp_dir());
    dirs
}

fn per_user_tmp_dir() -> PathBuf {
    let uid = nix::unistd::geteuid();
    PathBuf::from("/tmp").join(format!("quarry-{}", uid))
}

/// The daemon's well-known unix socket path.
pub(crate) fn socket_path() -> PathBuf {
    ensure_runtime_dir()
        .map(|dir| dir.join("lockd.sock"))
        .unwrap_or_else(|_| per_user_tmp_dir().join("lockd.sock"))
}

/// Daemon metadata (advertised address, pid) for client discovery.
pub(crate) fn meta_path() -> PathBuf {
    ensure_runtime_dir()
        .map(|dir| dir.join("lockd.meta.json"))
        .unwrap_or_else(|_| per_user_tmp_dir().join("lockd.meta.json"))
}

/// Lock file taken by the client that spawns the daemon, to avoid herds.
pub(crate) fn spawn_lock_path() -> PathBuf {
    ensure_runtime_dir()
        .map(|dir| dir.join("lockd.spawn.lock"))
        .unwrap_or_else(|_| per_user_tmp_dir().join("lockd.spawn.lock"))
}
