//! Cross-process named locks over a local socket.
//!
//! Split into a daemon ([`server::LockServer`]) owning the lock tables and a
//! client library ([`client::LockClient`]) embedded in callers. The daemon
//! is bound to one local endpoint (unix-domain or loopback TCP), serves
//! shared/exclusive locks with FIFO queues per key, and shuts itself down
//! after an idle grace period.

pub mod client;
pub mod proto;
pub mod server;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Transience;

pub use client::LockClient;
pub use server::LockServer;

/// Socket family the daemon binds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketFamily {
    /// Unix-domain stream socket (default).
    Unix,
    /// Loopback TCP.
    Inet,
}

impl SocketFamily {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("unix") {
            Some(SocketFamily::Unix)
        } else if raw.eq_ignore_ascii_case("inet") {
            Some(SocketFamily::Inet)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SocketFamily::Unix => "unix",
            SocketFamily::Inet => "inet",
        }
    }
}

impl fmt::Display for SocketFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the lock client and daemon.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IpcError {
    /// Malformed frame, unknown command or broken handshake.
    #[error("ipc protocol error: {reason}")]
    Protocol { reason: String },

    /// Daemon not reachable and auto-spawn failed.
    #[error("lock daemon unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl IpcError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        IpcError::Protocol {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        IpcError::Unavailable {
            reason: reason.into(),
        }
    }

    /// Protocol and availability failures are not retryable at this layer;
    /// only raw transport errors may clear up on their own.
    pub fn transience(&self) -> Transience {
        match self {
            IpcError::Protocol { .. } | IpcError::Unavailable { .. } => Transience::Permanent,
            IpcError::Io(_) => Transience::Retryable,
        }
    }
}

/// Metadata the daemon writes next to its socket so later clients can find
/// the advertised address without a handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub version: String,
    pub pid: u32,
    pub address: String,
}

// =============================================================================
// Socket plumbing - one abstraction over both families
// =============================================================================

pub(crate) enum IpcListener {
    Unix(UnixListener),
    Inet(TcpListener),
}

impl IpcListener {
    /// Binds the daemon endpoint: the well-known runtime socket for unix,
    /// an ephemeral loopback port for inet.
    pub(crate) fn bind(family: SocketFamily) -> io::Result<Self> {
        match family {
            SocketFamily::Unix => {
                let path = crate::paths::socket_path();
                Self::bind_unix(&path)
            }
            SocketFamily::Inet => Ok(IpcListener::Inet(TcpListener::bind("127.0.0.1:0")?)),
        }
    }

    pub(crate) fn bind_unix(path: &Path) -> io::Result<Self> {
        // A previous daemon may have left a stale socket file behind.
        if UnixStream::connect(path).is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("daemon already listening on {}", path.display()),
            ));
        }
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(IpcListener::Unix(listener))
    }

    pub(crate) fn accept(&self) -> io::Result<IpcStream> {
        match self {
            IpcListener::Unix(listener) => listener.accept().map(|(s, _)| IpcStream::Unix(s)),
            IpcListener::Inet(listener) => listener.accept().map(|(s, _)| IpcStream::Inet(s)),
        }
    }

    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            IpcListener::Unix(listener) => listener.set_nonblocking(nonblocking),
            IpcListener::Inet(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    /// Address string a client can dial, e.g. `unix:/run/user/1/quarry/lockd.sock`
    /// or `inet:127.0.0.1:40123`.
    pub(crate) fn local_address(&self) -> io::Result<String> {
        match self {
            IpcListener::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().ok_or_else(|| {
                    io::Error::other("unix listener has no pathname address")
                })?;
                Ok(format_unix_address(path))
            }
            IpcListener::Inet(listener) => Ok(format_inet_address(listener.local_addr()?)),
        }
    }

    pub(crate) fn unlink(&self) {
        if let IpcListener::Unix(listener) = self
            && let Ok(addr) = listener.local_addr()
            && let Some(path) = addr.as_pathname()
        {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub(crate) enum IpcStream {
    Unix(UnixStream),
    Inet(TcpStream),
}

impl IpcStream {
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        match self {
            IpcStream::Unix(s) => s.try_clone().map(IpcStream::Unix),
            IpcStream::Inet(s) => s.try_clone().map(IpcStream::Inet),
        }
    }

    pub(crate) fn shutdown(&self) {
        match self {
            IpcStream::Unix(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            IpcStream::Inet(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        match self {
            IpcStream::Unix(s) => s.set_read_timeout(timeout),
            IpcStream::Inet(s) => s.set_read_timeout(timeout),
        }
    }
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            IpcStream::Unix(s) => s.read(buf),
            IpcStream::Inet(s) => s.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            IpcStream::Unix(s) => s.write(buf),
            IpcStream::Inet(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            IpcStream::Unix(s) => s.flush(),
            IpcStream::Inet(s) => s.flush(),
        }
    }
}

pub(crate) fn format_unix_address(path: &Path) -> String {
    format!("unix:{}", path.display())
}

pub(crate) fn format_inet_address(addr: SocketAddr) -> String {
    format!("inet:{addr}")
}

/// Dials an address string produced by [`IpcListener::local_address`].
pub(crate) fn connect_address(address: &str) -> Result<IpcStream, IpcError> {
    if let Some(path) = address.strip_prefix("unix:") {
        Ok(IpcStream::Unix(UnixStream::connect(PathBuf::from(path))?))
    } else if let Some(addr) = address.strip_prefix("inet:") {
        Ok(IpcStream::Inet(TcpStream::connect(addr)?))
    } else {
        Err(IpcError::protocol(format!(
            "unsupported endpoint address `{address}`"
        )))
    }
}
