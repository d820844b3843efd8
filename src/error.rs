//! # Error Kinds
//!
//! Every fallible operation returns `eyre::Result`; failure sites attach one
//! of the typed kinds below so callers can branch on
//! `report.downcast_ref::<DbError>()` while still getting a full context
//! chain in the rendered message.
//!
//! I/O failures are special: once one escapes a client operation or a
//! background thread, the database flips into a poisoned state and every
//! subsequent operation fails fast with [`DbError::Poisoned`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    KeyExists,

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("bad configuration: {0}")]
    BadConfig(String),

    #[error("bad file: {0}")]
    BadFile(String),

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("database directory is locked by another process: {0}")]
    LockBusy(String),

    #[error("database is poisoned by a previous fatal error")]
    Poisoned,
}

/// Extracts the typed kind from a report, if one was attached anywhere in
/// the chain.
pub fn error_kind(report: &eyre::Report) -> Option<&DbError> {
    report.chain().find_map(|e| e.downcast_ref::<DbError>())
}

/// Whether the failure involved the filesystem and must poison the database.
pub fn is_io_failure(report: &eyre::Report) -> bool {
    if report.chain().any(|e| e.is::<std::io::Error>()) {
        return true;
    }
    matches!(error_kind(report), Some(DbError::Io(_)))
}
