//! Export ("zip") jobs and their download progress records.

use crate::models::status::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What an export job archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportTarget {
    /// A single resource of the given type.
    ResourceType(String),
    /// A whole folder tree on the given storage backend.
    StorageType(String),
}

/// Tracks one bulk archive request of an owner for a folder or resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub owner_id: String,
    pub subject_id: String,
    pub request_id: String,

    pub status: JobStatus,

    /// Human-readable failure description once the job is in ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(flatten)]
    pub target: ExportTarget,

    /// Items skipped while archiving, grouped by exclusion reason.
    #[serde(default)]
    pub excluded_files: BTreeMap<String, Vec<String>>,

    /// Status of the main manifest archive, tracked apart from the part archives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_zip_status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_zip_details: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_part: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_size: Option<u64>,

    /// Result location, known once the first part has been written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Lease expiry, owned by the record store rather than the payload.
    #[serde(skip)]
    pub ttl: DateTime<Utc>,
}

impl ExportJob {
    pub fn new(
        owner_id: impl Into<String>,
        subject_id: impl Into<String>,
        request_id: impl Into<String>,
        target: ExportTarget,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            subject_id: subject_id.into(),
            request_id: request_id.into(),
            status: JobStatus::InProgress,
            details: None,
            target,
            excluded_files: BTreeMap::new(),
            main_zip_status: None,
            main_zip_details: None,
            uploaded_part: None,
            uploaded_size: None,
            bucket: None,
            region: None,
            ttl: DateTime::default(),
        }
    }
}

/// Download progress of an export, addressable by request id alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub request_id: String,
    #[serde(default)]
    pub downloaded_part: u32,
    #[serde(skip)]
    pub ttl: DateTime<Utc>,
}

/// Which archive of an export a blob holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivePart {
    /// The whole export in one archive.
    Single,
    /// Numbered part of a streamed multi-part export.
    Part(u32),
    /// The main manifest archive of a multi-part export.
    Main,
}

impl ArchivePart {
    /// Object key of this archive within the export's bucket.
    pub fn object_key(&self, request_id: &str) -> String {
        match self {
            Self::Single => request_id.to_string(),
            Self::Part(n) => format!("{}/{}", request_id, n),
            Self::Main => format!("{}/main", request_id),
        }
    }
}
