use thiserror::Error;

use crate::ipc::IpcError;
use crate::update::UpdateCheckError;
use crate::version::VersionRangeError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; the subsystems themselves
/// return their own types.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Version(#[from] VersionRangeError),

    #[error(transparent)]
    Update(#[from] UpdateCheckError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Version(_) | Error::Update(_) => Transience::Permanent,
            Error::Ipc(e) => e.transience(),
        }
    }
}
