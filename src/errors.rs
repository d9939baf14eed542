//! Error taxonomy for the backup engine.
//!
//! Everything fallible returns `anyhow::Result`. Checks made by this crate
//! raise a `BackupError` wrapped into `anyhow::Error`, so callers can classify
//! a failure with `error_kind(&err)` without string matching.

/// Broad failure class. Only `ErrorKind::Consistency` raised on a trailing
/// log block is ever retried (and then it is never surfaced as an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// open/read/write/rename failure
    #[error("io")]
    Io,
    /// unrecognized delta tag, malformed metadata, unsupported page size
    #[error("format")]
    Format,
    /// log sequence mismatch, checksum failure on the final pass, log wrap-around
    #[error("consistency")]
    Consistency,
    /// mutually exclusive options, missing pipe for a datasink node
    #[error("config")]
    Config,
    /// allocation failure
    #[error("resource")]
    Resource,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error: {msg}")]
pub struct BackupError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl BackupError {
    pub fn new<S: Into<String>>(kind: ErrorKind, msg: S) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }
}

#[inline]
pub fn io_err<S: Into<String>>(msg: S) -> anyhow::Error {
    anyhow::Error::new(BackupError::new(ErrorKind::Io, msg))
}

#[inline]
pub fn format_err<S: Into<String>>(msg: S) -> anyhow::Error {
    anyhow::Error::new(BackupError::new(ErrorKind::Format, msg))
}

#[inline]
pub fn consistency_err<S: Into<String>>(msg: S) -> anyhow::Error {
    anyhow::Error::new(BackupError::new(ErrorKind::Consistency, msg))
}

#[inline]
pub fn config_err<S: Into<String>>(msg: S) -> anyhow::Error {
    anyhow::Error::new(BackupError::new(ErrorKind::Config, msg))
}

#[inline]
pub fn resource_err<S: Into<String>>(msg: S) -> anyhow::Error {
    anyhow::Error::new(BackupError::new(ErrorKind::Resource, msg))
}

/// Classify an error chain. Plain `std::io::Error`s count as `Io`.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    for cause in err.chain() {
        if let Some(be) = cause.downcast_ref::<BackupError>() {
            return Some(be.kind);
        }
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return Some(ErrorKind::Io);
        }
    }
    None
}
