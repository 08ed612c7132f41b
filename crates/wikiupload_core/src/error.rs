use thiserror::Error;

/// Failure of a single remote operation.
///
/// Only `Auth` is fatal for a run. Everything else is recorded against the
/// target that produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

pub type RemoteResult<T> = std::result::Result<T, UploadError>;
