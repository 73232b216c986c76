use crate::services::{blob_store::BlobError, record_store::StoreError};
use std::io;
use thiserror::Error;

/// Errors surfaced by the job managers.
///
/// A record that is missing or expired is never an error; lookups return
/// `None` for it.
#[derive(Debug, Error)]
pub enum JobError {
    /// Caller passed an incomplete request; raised before any I/O.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("record `{0}` already exists")]
    Conflict(String),
    /// Conditional updates kept losing to concurrent writers.
    #[error("record `{key}` is contended after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
    /// A status change that would move a record backwards.
    #[error("record `{key}` cannot move from {from} to {to}")]
    InvalidTransition { key: String, from: String, to: String },
    #[error("record `{key}` could not be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record payload could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures caused by running out of memory.
    pub fn is_resource_exhausted(&self) -> bool {
        match self {
            Self::ResourceExhausted(_) => true,
            Self::Blob(BlobError::Io(err)) => err.kind() == io::ErrorKind::OutOfMemory,
            _ => false,
        }
    }
}

/// Reject empty identifiers before touching any store.
pub(crate) fn require_id(name: &str, value: &str) -> JobResult<()> {
    if value.trim().is_empty() {
        return Err(JobError::validation(format!("{} must not be empty", name)));
    }
    Ok(())
}

/// Separator between the segments of a composite sort key.
pub(crate) const KEY_SEPARATOR: char = '#';

/// Like [`require_id`], and also reject ids containing the sort key
/// separator so two distinct id pairs can never share a key.
pub(crate) fn require_key_segment(name: &str, value: &str) -> JobResult<()> {
    require_id(name, value)?;
    if value.contains(KEY_SEPARATOR) {
        return Err(JobError::validation(format!(
            "{} must not contain `{}`",
            name, KEY_SEPARATOR
        )));
    }
    Ok(())
}
