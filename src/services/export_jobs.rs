//! Export ("zip") job tracking.
//!
//! Every mutating call rewrites the whole record and slides its lease to the
//! full export window, so a job stays visible for as long as its worker keeps
//! reporting progress and silently expires once the worker stops. Writes are
//! last-write-wins: one export is driven by exactly one worker at a time.

use crate::{
    errors::{JobError, JobResult, KEY_SEPARATOR, require_id, require_key_segment},
    models::{
        blob::BlobLocation,
        export::{ArchivePart, DownloadRecord, ExportJob, ExportTarget},
        record::{RecordKey, RecordQuery},
        status::JobStatus,
    },
    services::{
        context::{JobContext, from_record, to_fields},
        localization::OUT_OF_MEMORY,
    },
};
use bytes::Bytes;
use tracing::{debug, error, info};

const UNSPECIFIED_FAILURE: &str = "export failed for an unspecified reason";

#[derive(Clone)]
pub struct ExportJobManager {
    ctx: JobContext,
}

impl ExportJobManager {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    fn job_key(&self, owner_id: &str, subject_id: &str, request_id: &str) -> RecordKey {
        RecordKey::new(
            format!("{}{}", self.ctx.config.prefixes.export_jobs, owner_id),
            format!("{}{}{}", subject_id, KEY_SEPARATOR, request_id),
        )
    }

    fn download_key(&self, request_id: &str) -> RecordKey {
        RecordKey::new(self.ctx.config.prefixes.export_downloads.clone(), request_id)
    }

    /// Persist the full job and slide its lease.
    async fn save(&self, job: &mut ExportJob) -> JobResult<()> {
        job.ttl = self.ctx.lease(self.ctx.config.export_lease);
        let key = self.job_key(&job.owner_id, &job.subject_id, &job.request_id);
        self.ctx.records.put(&key, &to_fields(job)?, job.ttl).await?;
        Ok(())
    }

    /// Register a new IN_PROGRESS export for `subject_id` owned by `owner_id`.
    pub async fn create_export_job(
        &self,
        owner_id: &str,
        subject_id: &str,
        target: ExportTarget,
    ) -> JobResult<ExportJob> {
        require_id("ownerId", owner_id)?;
        require_key_segment("subjectId", subject_id)?;

        let mut job = ExportJob::new(owner_id, subject_id, self.ctx.ids.next_id(), target);
        self.save(&mut job).await?;
        info!(owner_id, subject_id, request_id = %job.request_id, "export job created");
        Ok(job)
    }

    pub async fn find_export_job(
        &self,
        owner_id: &str,
        subject_id: &str,
        request_id: &str,
    ) -> JobResult<Option<ExportJob>> {
        require_key_segment("subjectId", subject_id)?;
        let key = self.job_key(owner_id, subject_id, request_id);
        self.ctx
            .records
            .get(&key)
            .await?
            .map(|record| from_record(&record))
            .transpose()
    }

    /// Live exports of an owner, optionally narrowed to one subject.
    pub async fn list_export_jobs(
        &self,
        owner_id: &str,
        subject_id: Option<&str>,
    ) -> JobResult<Vec<ExportJob>> {
        require_id("ownerId", owner_id)?;
        let mut query =
            RecordQuery::partition(format!("{}{}", self.ctx.config.prefixes.export_jobs, owner_id));
        if let Some(subject_id) = subject_id {
            require_key_segment("subjectId", subject_id)?;
            query = query.sort_prefix(format!("{}{}", subject_id, KEY_SEPARATOR));
        }
        self.ctx
            .records
            .query(&query)
            .await?
            .iter()
            .map(from_record)
            .collect()
    }

    /// Replace the list of items skipped for `reason`. Status is unchanged.
    pub async fn record_excluded_items(
        &self,
        job: &mut ExportJob,
        items: Vec<String>,
        reason: &str,
    ) -> JobResult<()> {
        require_id("reason", reason)?;
        debug!(request_id = %job.request_id, reason, count = items.len(), "recording excluded items");
        job.excluded_files.insert(reason.to_string(), items);
        self.save(job).await
    }

    /// Update the main archive's status, independent of the overall job status.
    pub async fn update_main_archive_status(
        &self,
        job: &mut ExportJob,
        status: JobStatus,
        details: Option<String>,
    ) -> JobResult<()> {
        if status == JobStatus::Error {
            error!(
                owner_id = %job.owner_id,
                request_id = %job.request_id,
                details = details.as_deref().unwrap_or_default(),
                "main archive failed"
            );
        }
        job.main_zip_status = Some(status);
        job.main_zip_details = details;
        self.save(job).await
    }

    /// Persist part/size counters the caller has already advanced on `job`.
    ///
    /// The store write replaces the record; it is not a server-side increment.
    pub async fn record_part_uploaded(&self, job: &mut ExportJob) -> JobResult<()> {
        debug!(
            request_id = %job.request_id,
            uploaded_part = ?job.uploaded_part,
            uploaded_size = ?job.uploaded_size,
            "part uploaded"
        );
        self.save(job).await
    }

    /// Write one archive of the export and report the resulting job status.
    ///
    /// Failures while storing the bytes or the progress are absorbed: the job
    /// moves to ERROR with a displayable message and `Ok(JobStatus::Error)` is
    /// returned. Only a missing request id or a failure to persist the ERROR
    /// itself is returned as `Err`.
    pub async fn write_result_bytes(
        &self,
        job: &mut ExportJob,
        location: &BlobLocation,
        data: Bytes,
        part: ArchivePart,
        is_final_part: bool,
        locale: &str,
    ) -> JobResult<JobStatus> {
        require_id("requestId", &job.request_id)?;

        match self.store_result(job, location, data, part, is_final_part).await {
            Ok(()) => Ok(job.status.clone()),
            Err(err) => {
                let details = self.failure_details(&err, locale);
                self.fail_job(job, details).await?;
                Ok(JobStatus::Error)
            }
        }
    }

    async fn store_result(
        &self,
        job: &mut ExportJob,
        location: &BlobLocation,
        data: Bytes,
        part: ArchivePart,
        is_final_part: bool,
    ) -> JobResult<()> {
        let key = part.object_key(&job.request_id);
        let size = data.len() as u64;
        self.ctx.blobs.put(location, &key, data).await?;

        job.bucket = Some(location.bucket.clone());
        job.region = Some(location.region.clone());
        if let ArchivePart::Part(n) = part {
            job.uploaded_part = Some(n);
            job.uploaded_size = Some(job.uploaded_size.unwrap_or(0) + size);
        }
        if is_final_part {
            job.status = JobStatus::Success;
            job.details = None;
        }
        self.save(job).await?;

        if is_final_part {
            info!(request_id = %job.request_id, key = %key, "export completed");
        }
        Ok(())
    }

    fn failure_details(&self, err: &JobError, locale: &str) -> String {
        if err.is_resource_exhausted() {
            return self.ctx.localizer.localize(OUT_OF_MEMORY, locale);
        }
        let message = err.to_string();
        if message.trim().is_empty() {
            UNSPECIFIED_FAILURE.to_string()
        } else {
            message
        }
    }

    /// Move the job to ERROR with `details`.
    pub async fn fail_job(&self, job: &mut ExportJob, details: impl Into<String>) -> JobResult<()> {
        let details = details.into();
        error!(
            owner_id = %job.owner_id,
            subject_id = %job.subject_id,
            request_id = %job.request_id,
            details = %details,
            "export job failed"
        );
        job.status = JobStatus::Error;
        job.details = Some(details);
        self.save(job).await
    }

    /// Returns whether a live or expired row was removed.
    pub async fn delete_export_job(
        &self,
        owner_id: &str,
        subject_id: &str,
        request_id: &str,
    ) -> JobResult<bool> {
        require_key_segment("subjectId", subject_id)?;
        let key = self.job_key(owner_id, subject_id, request_id);
        Ok(self.ctx.records.delete(&key).await?)
    }

    pub async fn create_download_record(&self, request_id: &str) -> JobResult<DownloadRecord> {
        require_id("requestId", request_id)?;
        let mut record = DownloadRecord {
            request_id: request_id.to_string(),
            downloaded_part: 0,
            ttl: Default::default(),
        };
        self.save_download(&mut record).await?;
        Ok(record)
    }

    pub async fn find_download_record(&self, request_id: &str) -> JobResult<Option<DownloadRecord>> {
        self.ctx
            .records
            .get(&self.download_key(request_id))
            .await?
            .map(|record| from_record(&record))
            .transpose()
    }

    /// Count one more part fetched by the client and slide the lease.
    pub async fn record_part_downloaded(&self, record: &mut DownloadRecord) -> JobResult<()> {
        record.downloaded_part += 1;
        self.save_download(record).await
    }

    pub async fn delete_download_record(&self, request_id: &str) -> JobResult<bool> {
        Ok(self.ctx.records.delete(&self.download_key(request_id)).await?)
    }

    async fn save_download(&self, record: &mut DownloadRecord) -> JobResult<()> {
        record.ttl = self.ctx.lease(self.ctx.config.export_lease);
        let key = self.download_key(&record.request_id);
        self.ctx
            .records
            .put(&key, &to_fields(record)?, record.ttl)
            .await?;
        Ok(())
    }

    /// Location of the job's results; requires at least one written part.
    fn result_location(job: &ExportJob) -> JobResult<BlobLocation> {
        require_id("requestId", &job.request_id)?;
        match (&job.bucket, &job.region) {
            (Some(bucket), Some(region)) => Ok(BlobLocation::new(bucket, region)),
            _ => Err(JobError::validation(format!(
                "export `{}` has no result location yet",
                job.request_id
            ))),
        }
    }

    pub async fn fetch_result_bytes(
        &self,
        job: &ExportJob,
        part: ArchivePart,
    ) -> JobResult<Option<Bytes>> {
        let location = Self::result_location(job)?;
        Ok(self
            .ctx
            .blobs
            .get(&location, &part.object_key(&job.request_id))
            .await?)
    }

    pub async fn fetch_download_url(&self, job: &ExportJob, part: ArchivePart) -> JobResult<String> {
        let location = Self::result_location(job)?;
        Ok(self
            .ctx
            .blobs
            .issue_download_url(&location, &part.object_key(&job.request_id))
            .await?)
    }

    /// Remove result objects once the client has everything it needs.
    pub async fn delete_result_blobs(&self, job: &ExportJob, parts: &[ArchivePart]) -> JobResult<()> {
        let location = Self::result_location(job)?;
        for part in parts {
            self.ctx
                .blobs
                .delete(&location, &part.object_key(&job.request_id))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        blob_store::{BlobError, BlobResult, BlobStore},
        clock::Clock,
        record_store::{RecordStore, StoreError, StoreResult},
        testing::{Harness, harness},
    };
    use crate::models::{
        blob::BlobObject,
        record::{Fields, Precondition, RecordQuery, StoredRecord},
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use std::{
        io,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
    };

    struct FailingBlobs(io::ErrorKind);

    #[async_trait]
    impl BlobStore for FailingBlobs {
        async fn put(&self, _: &BlobLocation, _: &str, _: Bytes) -> BlobResult<BlobObject> {
            Err(BlobError::Io(io::Error::new(self.0, "disk write failed")))
        }
        async fn get(&self, _: &BlobLocation, _: &str) -> BlobResult<Option<Bytes>> {
            Ok(None)
        }
        async fn delete(&self, _: &BlobLocation, _: &str) -> BlobResult<()> {
            Ok(())
        }
        async fn issue_download_url(&self, _: &BlobLocation, _: &str) -> BlobResult<String> {
            Ok(String::new())
        }
        async fn probe(&self) -> BlobResult<()> {
            Ok(())
        }
    }

    /// Delegates to a real store; the next `failures` puts fail.
    struct FlakyRecords {
        inner: Arc<dyn RecordStore>,
        failures: AtomicU32,
    }

    #[async_trait]
    impl RecordStore for FlakyRecords {
        async fn put(&self, key: &RecordKey, fields: &Fields, ttl: DateTime<Utc>) -> StoreResult<StoredRecord> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Sqlx(sqlx::Error::PoolTimedOut));
            }
            self.inner.put(key, fields, ttl).await
        }
        async fn put_conditional(
            &self,
            key: &RecordKey,
            fields: &Fields,
            ttl: DateTime<Utc>,
            precondition: Precondition,
        ) -> StoreResult<bool> {
            self.inner.put_conditional(key, fields, ttl, precondition).await
        }
        async fn get(&self, key: &RecordKey) -> StoreResult<Option<StoredRecord>> {
            self.inner.get(key).await
        }
        async fn update(
            &self,
            key: &RecordKey,
            patch: &Fields,
            ttl: Option<DateTime<Utc>>,
        ) -> StoreResult<Option<StoredRecord>> {
            self.inner.update(key, patch, ttl).await
        }
        async fn delete(&self, key: &RecordKey) -> StoreResult<bool> {
            self.inner.delete(key).await
        }
        async fn query(&self, query: &RecordQuery) -> StoreResult<Vec<StoredRecord>> {
            self.inner.query(query).await
        }
        async fn purge_expired(&self) -> StoreResult<u64> {
            self.inner.purge_expired().await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    fn manager(h: &Harness) -> ExportJobManager {
        ExportJobManager::new(h.ctx.clone())
    }

    fn failing_manager(h: &Harness, kind: io::ErrorKind) -> ExportJobManager {
        let mut ctx = h.ctx.clone();
        ctx.blobs = Arc::new(FailingBlobs(kind));
        ExportJobManager::new(ctx)
    }

    fn loc() -> BlobLocation {
        BlobLocation::new("exports", "us-east-1")
    }

    #[tokio::test]
    async fn new_job_is_in_progress_with_two_hour_lease() {
        let h = harness().await;
        let exports = manager(&h);
        let job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        assert_eq!(job.request_id, "id-1");
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.ttl, h.clock.now() + Duration::hours(2));

        let stored = exports.find_export_job("u1", "f1", "id-1").await.unwrap().unwrap();
        assert_eq!(stored, job);
    }

    #[tokio::test]
    async fn blank_owner_is_rejected() {
        let h = harness().await;
        let err = manager(&h)
            .create_export_job("", "f1", ExportTarget::ResourceType("file".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn every_progress_write_slides_the_lease() {
        let h = harness().await;
        let exports = manager(&h);
        let mut job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        for part in 1..=3u32 {
            h.clock.advance(Duration::minutes(90));
            job.uploaded_part = Some(part);
            job.uploaded_size = Some(u64::from(part) * 1024);
            exports.record_part_uploaded(&mut job).await.unwrap();

            let stored = exports.find_export_job("u1", "f1", &job.request_id).await.unwrap().unwrap();
            assert_eq!(stored.uploaded_part, Some(part));
            assert_eq!(stored.uploaded_size, Some(u64::from(part) * 1024));
            assert_eq!(stored.ttl, h.clock.now() + Duration::hours(2));
        }

        h.clock.advance(Duration::hours(2));
        assert!(exports.find_export_job("u1", "f1", &job.request_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn excluded_items_and_main_archive_leave_status_alone() {
        let h = harness().await;
        let exports = manager(&h);
        let mut job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        exports
            .record_excluded_items(&mut job, vec!["a.txt".into()], "TOO_LARGE")
            .await
            .unwrap();
        exports
            .record_excluded_items(&mut job, vec!["b.txt".into(), "c.txt".into()], "TOO_LARGE")
            .await
            .unwrap();
        exports
            .update_main_archive_status(&mut job, JobStatus::Success, Some("manifest".into()))
            .await
            .unwrap();

        let stored = exports.find_export_job("u1", "f1", &job.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::InProgress);
        assert_eq!(stored.excluded_files["TOO_LARGE"], vec!["b.txt", "c.txt"]);
        assert_eq!(stored.main_zip_status, Some(JobStatus::Success));
        assert_eq!(stored.main_zip_details.as_deref(), Some("manifest"));
    }

    #[tokio::test]
    async fn multi_part_write_tracks_progress_until_final() {
        let h = harness().await;
        let exports = manager(&h);
        let mut job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        let status = exports
            .write_result_bytes(&mut job, &loc(), Bytes::from_static(b"part-1"), ArchivePart::Part(1), false, "en")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::InProgress);

        let status = exports
            .write_result_bytes(&mut job, &loc(), Bytes::from_static(b"part-22"), ArchivePart::Part(2), true, "en")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Success);

        let stored = exports.find_export_job("u1", "f1", &job.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.uploaded_part, Some(2));
        assert_eq!(stored.uploaded_size, Some(13));
        assert_eq!(stored.bucket.as_deref(), Some("exports"));

        let part = exports.fetch_result_bytes(&stored, ArchivePart::Part(2)).await.unwrap().unwrap();
        assert_eq!(&part[..], b"part-22");
    }

    #[tokio::test]
    async fn failed_write_becomes_error_with_message() {
        let h = harness().await;
        let exports = failing_manager(&h, io::ErrorKind::PermissionDenied);
        let mut job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        let status = exports
            .write_result_bytes(&mut job, &loc(), Bytes::from_static(b"zip"), ArchivePart::Single, true, "en")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Error);

        let stored = exports.find_export_job("u1", "f1", &job.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.details.as_deref(), Some("disk write failed"));
    }

    #[tokio::test]
    async fn failed_progress_save_becomes_error() {
        let h = harness().await;
        let flaky = Arc::new(FlakyRecords {
            inner: h.ctx.records.clone(),
            failures: AtomicU32::new(0),
        });
        let mut ctx = h.ctx.clone();
        ctx.records = flaky.clone();
        let exports = ExportJobManager::new(ctx);
        let mut job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        flaky.failures.store(1, Ordering::SeqCst);
        let status = exports
            .write_result_bytes(&mut job, &loc(), Bytes::from_static(b"zip"), ArchivePart::Single, true, "en")
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Error);

        let stored = exports.find_export_job("u1", "f1", &job.request_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.details.unwrap().starts_with("record store unavailable"));
    }

    #[tokio::test]
    async fn out_of_memory_gets_localized_message() {
        let h = harness().await;
        let exports = failing_manager(&h, io::ErrorKind::OutOfMemory);
        let mut job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        exports
            .write_result_bytes(&mut job, &loc(), Bytes::from_static(b"zip"), ArchivePart::Single, true, "fr")
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.details.as_deref().unwrap().starts_with("L'archive"));
    }

    #[tokio::test]
    async fn fetching_results_requires_a_location() {
        let h = harness().await;
        let exports = manager(&h);
        let job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();

        assert!(matches!(
            exports.fetch_result_bytes(&job, ArchivePart::Single).await,
            Err(JobError::Validation(_))
        ));
        assert!(matches!(
            exports.fetch_download_url(&job, ArchivePart::Main).await,
            Err(JobError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn download_record_tracks_parts_and_can_be_deleted() {
        let h = harness().await;
        let exports = manager(&h);
        let mut download = exports.create_download_record("r9").await.unwrap();
        h.clock.advance(Duration::minutes(30));
        exports.record_part_downloaded(&mut download).await.unwrap();
        exports.record_part_downloaded(&mut download).await.unwrap();

        let stored = exports.find_download_record("r9").await.unwrap().unwrap();
        assert_eq!(stored.downloaded_part, 2);
        assert_eq!(stored.ttl, h.clock.now() + Duration::hours(2));

        assert!(exports.delete_download_record("r9").await.unwrap());
        assert!(exports.find_download_record("r9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_subject() {
        let h = harness().await;
        let exports = manager(&h);
        let target = ExportTarget::StorageType("s3".into());
        exports.create_export_job("u1", "f1", target.clone()).await.unwrap();
        exports.create_export_job("u1", "f2", target.clone()).await.unwrap();
        exports.create_export_job("u2", "f1", target).await.unwrap();

        assert_eq!(exports.list_export_jobs("u1", None).await.unwrap().len(), 2);
        let f2 = exports.list_export_jobs("u1", Some("f2")).await.unwrap();
        assert_eq!(f2.len(), 1);
        assert_eq!(f2[0].subject_id, "f2");
    }

    #[tokio::test]
    async fn subjects_cannot_contain_the_key_separator() {
        let h = harness().await;
        let exports = manager(&h);
        let target = ExportTarget::StorageType("s3".into());
        exports.create_export_job("u1", "f1", target.clone()).await.unwrap();

        let err = exports.create_export_job("u1", "f1#child", target).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(matches!(
            exports.list_export_jobs("u1", Some("f1#")).await,
            Err(JobError::Validation(_))
        ));
        assert!(matches!(
            exports.find_export_job("u1", "f1#id", "1").await,
            Err(JobError::Validation(_))
        ));

        let f1 = exports.list_export_jobs("u1", Some("f1")).await.unwrap();
        assert_eq!(f1.len(), 1);
        assert_eq!(f1[0].subject_id, "f1");
    }

    #[tokio::test]
    async fn delete_removes_job_and_results() {
        let h = harness().await;
        let exports = manager(&h);
        let mut job = exports
            .create_export_job("u1", "f1", ExportTarget::StorageType("s3".into()))
            .await
            .unwrap();
        exports
            .write_result_bytes(&mut job, &loc(), Bytes::from_static(b"zip"), ArchivePart::Single, true, "en")
            .await
            .unwrap();

        exports.delete_result_blobs(&job, &[ArchivePart::Single]).await.unwrap();
        assert!(exports.fetch_result_bytes(&job, ArchivePart::Single).await.unwrap().is_none());
        assert!(exports.delete_export_job("u1", "f1", &job.request_id).await.unwrap());
        assert!(exports.find_export_job("u1", "f1", &job.request_id).await.unwrap().is_none());
    }
}
