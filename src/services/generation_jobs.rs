//! Thumbnail, compare and convert request tracking.
//!
//! Requests live under a job-type prefix with the request id as sort key.
//! Thumbnail status updates run the retry policy in
//! [`GenerationRequest::apply_status`] and are written with a compare-and-swap
//! on the record version, so concurrent workers reporting failures for the
//! same file never lose an increment of the failure counter.

use crate::{
    errors::{JobError, JobResult, require_id},
    models::{
        generation::{GenerationRequest, JobType, RetryPolicy},
        record::{Fields, Precondition, RecordKey, RecordQuery},
        status::GenerationStatus,
    },
    services::context::{JobContext, from_record, to_fields},
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct GenerationJobManager {
    ctx: JobContext,
}

impl GenerationJobManager {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    fn prefix(&self, job_type: JobType) -> &str {
        let prefixes = &self.ctx.config.prefixes;
        match job_type {
            JobType::Thumbnail => &prefixes.thumbnail,
            JobType::Compare => &prefixes.compare,
            JobType::Convert => &prefixes.convert,
            JobType::Other => &prefixes.other,
        }
    }

    fn request_key(&self, job_type: JobType, request_id: &str) -> RecordKey {
        RecordKey::new(self.prefix(job_type), request_id)
    }

    fn retry_policy(&self) -> RetryPolicy {
        let cfg = &self.ctx.config;
        RetryPolicy {
            failure_threshold: cfg.failure_threshold,
            loading_lease: cfg.request_lease,
            retry_lease: cfg.retry_lease,
            settled_lease: cfg.settled_lease,
        }
    }

    /// Write a fresh LOADING request, replacing any previous one. Re-creating a
    /// request is how a caller retries after COULDNOTGENERATE.
    async fn create(&self, job_type: JobType, mut request: GenerationRequest) -> JobResult<GenerationRequest> {
        require_id("requestId", &request.request_id)?;
        request.ttl = self.ctx.lease(self.ctx.config.request_lease);
        let key = self.request_key(job_type, &request.request_id);
        self.ctx
            .records
            .put(&key, &to_fields(&request)?, request.ttl)
            .await?;
        info!(%job_type, request_id = %request.request_id, "generation request created");
        Ok(request)
    }

    pub async fn create_single_request(
        &self,
        job_type: JobType,
        request_id: &str,
        user_id: Option<&str>,
        external_id: Option<&str>,
    ) -> JobResult<GenerationRequest> {
        let mut request = GenerationRequest::new(request_id);
        request.user_id = user_id.map(str::to_string);
        request.external_id = external_id.map(str::to_string);
        self.create(job_type, request).await
    }

    /// A compare request references the two files being compared.
    pub async fn create_compare_request(
        &self,
        job_id: &str,
        user_id: Option<&str>,
        first_file_id: Option<&str>,
        second_file_id: Option<&str>,
    ) -> JobResult<GenerationRequest> {
        let mut request = GenerationRequest::new(job_id);
        request.user_id = user_id.map(str::to_string);
        request.first_file_id = first_file_id.map(str::to_string);
        request.second_file_id = second_file_id.map(str::to_string);
        self.create(JobType::Compare, request).await
    }

    pub async fn find_request(
        &self,
        job_type: JobType,
        request_id: &str,
    ) -> JobResult<Option<GenerationRequest>> {
        self.ctx
            .records
            .get(&self.request_key(job_type, request_id))
            .await?
            .map(|record| from_record(&record))
            .transpose()
    }

    pub async fn list_requests(&self, job_type: JobType) -> JobResult<Vec<GenerationRequest>> {
        let query = RecordQuery::partition(self.prefix(job_type));
        self.ctx
            .records
            .query(&query)
            .await?
            .iter()
            .map(from_record)
            .collect()
    }

    pub async fn remove_request(&self, job_type: JobType, request_id: &str) -> JobResult<bool> {
        Ok(self
            .ctx
            .records
            .delete(&self.request_key(job_type, request_id))
            .await?)
    }

    /// Set status and error of an existing request and refresh its lease.
    /// Returns `None` when the request has expired or never existed.
    pub async fn update_generic_status(
        &self,
        job_type: JobType,
        request_id: &str,
        status: GenerationStatus,
        error: Option<String>,
    ) -> JobResult<Option<GenerationRequest>> {
        require_id("requestId", request_id)?;
        if let Some(details) = &error {
            error!(%job_type, request_id, %status, details = %details, "generation request failed");
        }

        let mut patch = Fields::new();
        patch.insert("status".into(), Value::String(status.into()));
        patch.insert(
            "failedDetails".into(),
            error.map(Value::String).unwrap_or(Value::Null),
        );
        let ttl = self.ctx.lease(self.ctx.config.request_lease);

        self.ctx
            .records
            .update(&self.request_key(job_type, request_id), &patch, Some(ttl))
            .await?
            .map(|record| from_record(&record))
            .transpose()
    }

    /// Record a worker's outcome for a thumbnail and apply the retry policy.
    ///
    /// Reads the current record to learn the failure count, computes the next
    /// state and writes it only if nobody else wrote in between, retrying up
    /// to `cas_max_attempts` times. A missing record is created.
    pub async fn update_thumbnail_status(
        &self,
        request_id: &str,
        status: GenerationStatus,
        failed_details: Option<String>,
    ) -> JobResult<GenerationRequest> {
        require_id("requestId", request_id)?;
        let key = self.request_key(JobType::Thumbnail, request_id);
        let policy = self.retry_policy();
        let attempts = self.ctx.config.cas_max_attempts.max(1);

        for attempt in 1..=attempts {
            let (mut request, precondition) = match self.ctx.records.get(&key).await? {
                Some(record) => (from_record::<GenerationRequest>(&record)?, Precondition::Version(record.version)),
                None => (GenerationRequest::new(request_id), Precondition::Absent),
            };

            let lease = request.apply_status(status.clone(), failed_details.clone(), &policy);
            request.ttl = self.ctx.lease(lease);

            let written = self
                .ctx
                .records
                .put_conditional(&key, &to_fields(&request)?, request.ttl, precondition)
                .await?;
            if written {
                self.log_transition(&request);
                return Ok(request);
            }
            debug!(request_id, attempt, "thumbnail status raced with another writer");
        }

        warn!(request_id, attempts, "giving up on contended thumbnail status update");
        Err(JobError::Contention {
            key: key.to_string(),
            attempts,
        })
    }

    fn log_transition(&self, request: &GenerationRequest) {
        match &request.status {
            GenerationStatus::CouldNotGenerate => error!(
                request_id = %request.request_id,
                failures = request.no_of_failures.unwrap_or_default(),
                details = request.failed_details.as_deref().unwrap_or_default(),
                "thumbnail could not be generated, giving up"
            ),
            GenerationStatus::Unavailable => warn!(
                request_id = %request.request_id,
                failures = request.no_of_failures.unwrap_or_default(),
                "thumbnail unavailable, eligible for retry"
            ),
            status => debug!(request_id = %request.request_id, %status, "thumbnail status updated"),
        }
    }
}
