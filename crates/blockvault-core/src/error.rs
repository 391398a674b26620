//! Error taxonomy for the store.
//!
//! System errors are translated near the failing call through a fixed
//! [`io::ErrorKind`] map; anything unrecognized becomes [`Error::Unknown`].
//! Cleanup paths keep the first error that occurred and return it after the
//! best-effort unwind completes.

use std::io;

use blockvault_lock::LockError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no such file or entry: {0}")]
    Noent(String),

    #[error("out of memory")]
    Nomem,

    #[error("access denied: {0}")]
    Acces(String),

    #[error("already exists: {0}")]
    Exist(String),

    #[error("invalid argument: {0}")]
    Inval(String),

    #[error("insufficient space in the store: {0}")]
    Nospc(String),

    #[error("would block: {0}")]
    Again(String),

    #[error("bad handle: {0}")]
    Badf(String),

    #[error("too many open handles: {0}")]
    Mfile(String),

    #[error("signature mismatch")]
    Signature,

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn inval(msg: impl Into<String>) -> Self {
        Error::Inval(msg.into())
    }

    pub(crate) fn unknown(msg: impl Into<String>) -> Self {
        Error::Unknown(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            NotFound => Error::Noent(e.to_string()),
            PermissionDenied => Error::Acces(e.to_string()),
            AlreadyExists => Error::Exist(e.to_string()),
            WouldBlock | TimedOut => Error::Again(e.to_string()),
            OutOfMemory => Error::Nomem,
            InvalidInput | InvalidData => Error::Inval(e.to_string()),
            _ => Error::Unknown(e.to_string()),
        }
    }
}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout => Error::Again("timed out waiting for the lock".into()),
            LockError::ModeMismatch => {
                Error::Inval("lock mode mismatch with the existing lock".into())
            }
            LockError::TooManyHandles => Error::Mfile("too many open handles for one path".into()),
            LockError::StaleHandle => Error::Badf("lock handle was already released".into()),
            LockError::BadFlags => Error::Inval("bad lock flags".into()),
            LockError::Io(io_err) => io_err.into(),
        }
    }
}
