//! Single-item generation requests (thumbnail, compare, convert).

use crate::models::status::GenerationStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of generation job; selects the key prefix the request lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    Thumbnail,
    Compare,
    Convert,
    Other,
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Thumbnail => "thumbnail",
            Self::Compare => "compare",
            Self::Convert => "convert",
            Self::Other => "other",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Storage account context the request was issued under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_file_id: Option<String>,
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_of_failures: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_details: Option<String>,
    #[serde(skip)]
    pub ttl: DateTime<Utc>,
}

impl GenerationRequest {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
            external_id: None,
            first_file_id: None,
            second_file_id: None,
            status: GenerationStatus::Loading,
            no_of_failures: None,
            failed_details: None,
            ttl: DateTime::default(),
        }
    }

    /// Apply a status reported by a worker and return the lease the record
    /// should be stored with.
    ///
    /// UNAVAILABLE counts a failure; once the count reaches the policy
    /// threshold the stored status becomes COULDNOTGENERATE and the request is
    /// settled. LOADING leaves the failure history alone. Anything else is a
    /// settled outcome and clears it.
    pub fn apply_status(
        &mut self,
        status: GenerationStatus,
        failed_details: Option<String>,
        policy: &RetryPolicy,
    ) -> Duration {
        match status {
            GenerationStatus::Loading => {
                self.status = status;
                if failed_details.is_some() {
                    self.failed_details = failed_details;
                }
                policy.loading_lease
            }
            GenerationStatus::Unavailable => {
                let failures = self.no_of_failures.unwrap_or(0).saturating_add(1);
                self.no_of_failures = Some(failures);
                if failed_details.is_some() {
                    self.failed_details = failed_details;
                }
                if failures >= policy.failure_threshold {
                    self.status = GenerationStatus::CouldNotGenerate;
                    policy.settled_lease
                } else {
                    self.status = GenerationStatus::Unavailable;
                    policy.retry_lease
                }
            }
            settled => {
                self.status = settled;
                self.no_of_failures = None;
                self.failed_details = None;
                policy.settled_lease
            }
        }
    }
}

/// Leases and threshold driving [`GenerationRequest::apply_status`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub failure_threshold: u32,
    pub loading_lease: Duration,
    pub retry_lease: Duration,
    pub settled_lease: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            failure_threshold: 3,
            loading_lease: Duration::days(1),
            retry_lease: Duration::hours(3),
            settled_lease: Duration::days(30),
        }
    }

    #[test]
    fn third_unavailable_escalates() {
        let mut req = GenerationRequest::new("r1");
        req.no_of_failures = Some(2);
        let lease = req.apply_status(
            GenerationStatus::Unavailable,
            Some("provider timeout".into()),
            &policy(),
        );
        assert_eq!(req.status, GenerationStatus::CouldNotGenerate);
        assert_eq!(req.no_of_failures, Some(3));
        assert_eq!(req.failed_details.as_deref(), Some("provider timeout"));
        assert_eq!(lease, Duration::days(30));
    }

    #[test]
    fn unavailable_below_threshold_is_retryable() {
        let mut req = GenerationRequest::new("r1");
        let lease = req.apply_status(GenerationStatus::Unavailable, None, &policy());
        assert_eq!(req.status, GenerationStatus::Unavailable);
        assert_eq!(req.no_of_failures, Some(1));
        assert_eq!(lease, Duration::hours(3));
    }

    #[test]
    fn counter_keeps_growing_after_escalation() {
        let mut req = GenerationRequest::new("r1");
        req.no_of_failures = Some(3);
        req.status = GenerationStatus::CouldNotGenerate;
        req.apply_status(GenerationStatus::Unavailable, None, &policy());
        assert_eq!(req.no_of_failures, Some(4));
        assert_eq!(req.status, GenerationStatus::CouldNotGenerate);
    }

    #[test]
    fn loading_keeps_failure_history() {
        let mut req = GenerationRequest::new("r1");
        req.no_of_failures = Some(1);
        req.failed_details = Some("boom".into());
        let lease = req.apply_status(GenerationStatus::Loading, None, &policy());
        assert_eq!(req.no_of_failures, Some(1));
        assert_eq!(req.failed_details.as_deref(), Some("boom"));
        assert_eq!(lease, Duration::days(1));
    }

    #[test]
    fn settled_status_clears_failure_history() {
        for status in [
            GenerationStatus::Available,
            GenerationStatus::Unknown("GENERATED_V2".into()),
        ] {
            let mut req = GenerationRequest::new("r1");
            req.no_of_failures = Some(2);
            req.failed_details = Some("boom".into());
            let lease = req.apply_status(status.clone(), Some("ignored".into()), &policy());
            assert_eq!(req.status, status);
            assert_eq!(req.no_of_failures, None);
            assert_eq!(req.failed_details, None);
            assert_eq!(lease, Duration::days(30));
        }
    }
}
