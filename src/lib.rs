#![forbid(unsafe_code)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod ipc;
mod paths;
pub mod telemetry;
pub mod update;
pub mod version;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main entry points at the crate root for convenience
pub use crate::ipc::{IpcError, LockClient, LockServer, SocketFamily};
pub use crate::update::{
    CachedError, CheckKind, ErrorPolicy, RemoteRepository, Session, SessionMode, UpdateCheck,
    UpdateCheckManager, UpdatePolicy,
};
pub use crate::version::{Version, VersionRange, VersionRangeError, compare};
