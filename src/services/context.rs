//! Handles shared by every job manager.

use crate::{
    config::JobsConfig,
    errors::{JobError, JobResult},
    models::{
        chunk::ThumbnailChunk,
        export::{DownloadRecord, ExportJob},
        generation::GenerationRequest,
        record::{Fields, StoredRecord, decode, encode},
    },
    services::{
        blob_store::BlobStore,
        clock::Clock,
        ids::{IdGenerator, UuidIds},
        localization::{Localizer, MessageCatalog},
        record_store::RecordStore,
    },
};
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

/// Stores, seams and settings a manager is constructed with.
///
/// Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct JobContext {
    pub records: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
    pub localizer: Arc<dyn Localizer>,
    pub config: Arc<JobsConfig>,
}

impl JobContext {
    /// Context with random ids and the built-in message catalog.
    pub fn new(
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        config: JobsConfig,
    ) -> Self {
        Self {
            records,
            blobs,
            ids: Arc::new(UuidIds),
            clock,
            localizer: Arc::new(MessageCatalog::default()),
            config: Arc::new(config),
        }
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_localizer(mut self, localizer: Arc<dyn Localizer>) -> Self {
        self.localizer = localizer;
        self
    }

    /// Expiry of a lease of length `lease` starting now.
    pub(crate) fn lease(&self, lease: Duration) -> DateTime<Utc> {
        self.clock.now() + lease
    }
}

/// Models whose lease is tracked beside their payload.
pub(crate) trait Leased: Serialize + DeserializeOwned {
    fn set_ttl(&mut self, ttl: DateTime<Utc>);
}

macro_rules! leased {
    ($($model:ty),+) => {
        $(impl Leased for $model {
            fn set_ttl(&mut self, ttl: DateTime<Utc>) {
                self.ttl = ttl;
            }
        })+
    };
}

leased!(ExportJob, DownloadRecord, ThumbnailChunk, GenerationRequest);

pub(crate) fn to_fields<T: Leased>(model: &T) -> JobResult<Fields> {
    encode(model).map_err(JobError::Encode)
}

pub(crate) fn from_record<T: Leased>(record: &StoredRecord) -> JobResult<T> {
    let mut model: T = decode(record).map_err(|source| JobError::Decode {
        key: record.key.to_string(),
        source,
    })?;
    model.set_ttl(record.ttl);
    Ok(model)
}
