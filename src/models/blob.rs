//! Metadata of a result payload held by the blob store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Where an export's result objects live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLocation {
    pub bucket: String,
    pub region: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
        }
    }
}

/// A stored object. Holds its metadata only, not the payload bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BlobObject {
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    pub region: String,

    pub size_bytes: i64,

    /// MD5 of the payload, hex encoded.
    pub etag: String,

    pub last_modified: DateTime<Utc>,
}
