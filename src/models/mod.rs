//! Data models for the job-tracking core.
//!
//! Job records serialize to camelCase JSON payloads stored by the record
//! store; their lease (`ttl`) lives beside the payload rather than inside it.
//! Blob metadata maps to the `blobs` table via `sqlx::FromRow`.

pub mod blob;
pub mod chunk;
pub mod export;
pub mod generation;
pub mod record;
pub mod status;
