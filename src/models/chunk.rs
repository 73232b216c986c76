//! Chunks batching generation requests submitted under one group.

use crate::models::status::ChunkStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One member of a chunk, carrying its own copy of the chunk parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFile {
    pub file_id: String,
    #[serde(default)]
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailChunk {
    pub chunk_id: String,
    pub group_name: String,
    /// Members in submission order.
    pub files: Vec<ChunkFile>,
    pub status: ChunkStatus,
    #[serde(skip)]
    pub ttl: DateTime<Utc>,
}

impl ThumbnailChunk {
    pub fn new(
        chunk_id: impl Into<String>,
        group_name: impl Into<String>,
        file_ids: impl IntoIterator<Item = String>,
        info: &Value,
    ) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            group_name: group_name.into(),
            files: file_ids
                .into_iter()
                .map(|file_id| ChunkFile {
                    file_id,
                    info: info.clone(),
                })
                .collect(),
            status: ChunkStatus::InQueue,
            ttl: DateTime::default(),
        }
    }

    pub fn file_ids(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.file_id.as_str())
    }
}
