use thiserror::Error;

use crate::engine::EngineError;

pub type FsResult<T> = Result<T, FsError>;

/// Failure surfaced by the adapter layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    /// Operation accepted by the table but never delegated to the engine.
    #[error("operation not implemented")]
    Unimplemented,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl FsError {
    /// Positive errno carried by this failure. `Unimplemented` is the generic `-1` failure,
    /// which the kernel reads as `EPERM`.
    pub fn errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::Unimplemented => libc::EPERM,
            FsError::Engine(err) => err.errno(),
        }
    }

    /// The failure in the protocol's negative-errno convention.
    pub fn status(self) -> i32 {
        -self.errno()
    }
}

/// Fold an adapter result into the protocol's integer convention: a non-negative count on
/// success, a negative errno on failure.
pub fn to_status(result: FsResult<usize>) -> i32 {
    match result {
        Ok(count) => i32::try_from(count).unwrap_or(i32::MAX),
        Err(err) => err.status(),
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(err: FsError) -> Self {
        rfuse3::Errno::from(err.errno())
    }
}
