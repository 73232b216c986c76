//! Batches of generation requests grouped for a single worker pass.

use crate::{
    errors::{JobError, JobResult, require_id},
    models::{
        chunk::ThumbnailChunk,
        record::{Precondition, RecordKey, RecordQuery},
        status::ChunkStatus,
    },
    services::context::{JobContext, from_record, to_fields},
};
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ChunkAggregator {
    ctx: JobContext,
}

impl ChunkAggregator {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    fn group_partition(&self, group_name: &str) -> String {
        format!("{}{}", self.ctx.config.prefixes.chunks, group_name)
    }

    fn chunk_key(&self, chunk_id: &str, group_name: &str) -> RecordKey {
        RecordKey::new(self.group_partition(group_name), chunk_id)
    }

    /// Persist a new INQUEUE chunk holding `file_ids`, each member carrying its
    /// own copy of `info`.
    pub async fn create_chunk(
        &self,
        group_name: &str,
        file_ids: Vec<String>,
        info: &Value,
    ) -> JobResult<ThumbnailChunk> {
        require_id("groupName", group_name)?;
        if file_ids.is_empty() {
            return Err(JobError::validation("a chunk needs at least one file"));
        }

        let chunk_id = self.ctx.ids.next_id();
        let mut chunk = ThumbnailChunk::new(chunk_id, group_name, file_ids, info);
        chunk.ttl = self.ctx.lease(self.ctx.config.chunk_lease);

        let key = self.chunk_key(&chunk.chunk_id, group_name);
        let created = self
            .ctx
            .records
            .put_conditional(&key, &to_fields(&chunk)?, chunk.ttl, Precondition::Absent)
            .await?;
        if !created {
            return Err(JobError::Conflict(key.to_string()));
        }

        info!(
            chunk_id = %chunk.chunk_id,
            group = group_name,
            files = chunk.files.len(),
            "chunk queued"
        );
        Ok(chunk)
    }

    /// Read a chunk a worker is about to process. An expired or consumed chunk
    /// is `None`.
    pub async fn claim_chunk(
        &self,
        chunk_id: &str,
        group_name: &str,
    ) -> JobResult<Option<ThumbnailChunk>> {
        self.ctx
            .records
            .get(&self.chunk_key(chunk_id, group_name))
            .await?
            .map(|record| from_record(&record))
            .transpose()
    }

    /// Move a chunk forward to `status`. PROCESSING renews the lease; other
    /// statuses keep it. Moving backwards is [`JobError::InvalidTransition`].
    /// The write is conditional on the version that was read, so two workers
    /// racing on one chunk cannot undo each other.
    pub async fn advance_chunk_status(
        &self,
        chunk_id: &str,
        group_name: &str,
        status: ChunkStatus,
    ) -> JobResult<Option<ThumbnailChunk>> {
        let key = self.chunk_key(chunk_id, group_name);
        let attempts = self.ctx.config.cas_max_attempts.max(1);

        for attempt in 1..=attempts {
            let Some(record) = self.ctx.records.get(&key).await? else {
                return Ok(None);
            };
            let mut chunk: ThumbnailChunk = from_record(&record)?;
            if !chunk.status.can_advance_to(&status) {
                warn!(chunk_id, group = group_name, from = %chunk.status, to = %status, "rejected chunk transition");
                return Err(JobError::InvalidTransition {
                    key: key.to_string(),
                    from: chunk.status.to_string(),
                    to: status.to_string(),
                });
            }

            if status == ChunkStatus::Processing {
                chunk.ttl = self.ctx.lease(self.ctx.config.chunk_lease);
            }
            chunk.status = status.clone();

            let written = self
                .ctx
                .records
                .put_conditional(
                    &key,
                    &to_fields(&chunk)?,
                    chunk.ttl,
                    Precondition::Version(record.version),
                )
                .await?;
            if written {
                debug!(chunk_id, group = group_name, %status, "chunk advanced");
                return Ok(Some(chunk));
            }
            debug!(chunk_id, attempt, "chunk status raced with another writer");
        }

        Err(JobError::Contention {
            key: key.to_string(),
            attempts,
        })
    }

    /// Live chunks of `group_name` whose status is one of `statuses`, in chunk
    /// id order.
    pub async fn list_chunks_for_group(
        &self,
        group_name: &str,
        statuses: &[ChunkStatus],
    ) -> JobResult<Vec<ThumbnailChunk>> {
        let query = RecordQuery::partition(self.group_partition(group_name))
            .field_in("status", statuses.iter().map(ChunkStatus::as_str));
        self.ctx
            .records
            .query(&query)
            .await?
            .iter()
            .map(from_record)
            .collect()
    }

    /// Chunks still waiting for a worker.
    ///
    /// Storage kinds listed in `in_flight_tolerant_storage_kinds` also get
    /// PROCESSING chunks back: their workers can crash after claiming a chunk
    /// without leaving a visible trace, so a claimed chunk stays eligible until
    /// it is finished or its lease runs out.
    pub async fn list_pending_chunks_for_group(
        &self,
        group_name: &str,
        storage_kind: &str,
    ) -> JobResult<Vec<ThumbnailChunk>> {
        if self.ctx.config.tolerates_in_flight_chunks(storage_kind) {
            self.list_chunks_for_group(group_name, &[ChunkStatus::InQueue, ChunkStatus::Processing])
                .await
        } else {
            self.list_chunks_for_group(group_name, &[ChunkStatus::InQueue])
                .await
        }
    }

    pub async fn delete_chunk(&self, chunk_id: &str, group_name: &str) -> JobResult<bool> {
        Ok(self
            .ctx
            .records
            .delete(&self.chunk_key(chunk_id, group_name))
            .await?)
    }
}
