pub mod health_handlers;

use crate::services::{blob_store::BlobStore, record_store::RecordStore};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
}
