//! Subscriptions of waiters to a subject's completion.
//!
//! A subscription is an empty record keyed by `(subject, waiter)`, so
//! subscribing twice collapses into one row. Listing is a lazy paged scan;
//! nothing is snapshotted between pages.

use crate::{
    errors::{JobError, JobResult},
    models::record::{Fields, RecordKey, RecordQuery},
    services::context::JobContext,
};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use tracing::debug;

#[derive(Clone)]
pub struct WaiterRegistry {
    ctx: JobContext,
}

impl WaiterRegistry {
    pub fn new(ctx: JobContext) -> Self {
        Self { ctx }
    }

    fn subject_partition(&self, subject_id: &str) -> String {
        format!("{}{}", self.ctx.config.prefixes.waiters, subject_id)
    }

    /// Register `waiter_id` for `subject_id`, refreshing the one-day lease if
    /// it is already registered. An empty id is accepted and ignored.
    pub async fn subscribe(&self, subject_id: &str, waiter_id: &str) -> JobResult<bool> {
        if subject_id.is_empty() || waiter_id.is_empty() {
            return Ok(true);
        }
        let key = RecordKey::new(self.subject_partition(subject_id), waiter_id);
        let ttl = self.ctx.lease(self.ctx.config.subscription_lease);
        self.ctx.records.put(&key, &Fields::new(), ttl).await?;
        debug!(subject_id, waiter_id, "waiter subscribed");
        Ok(true)
    }

    pub async fn unsubscribe(&self, subject_id: &str, waiter_id: &str) -> JobResult<bool> {
        let key = RecordKey::new(self.subject_partition(subject_id), waiter_id);
        Ok(self.ctx.records.delete(&key).await?)
    }

    /// Waiter ids registered for `subject_id`, fetched a page at a time as the
    /// stream is polled.
    pub fn list_waiters(&self, subject_id: &str) -> BoxStream<'_, JobResult<String>> {
        let partition = self.subject_partition(subject_id);
        let page_size = self.ctx.config.waiter_page_size.max(1);

        stream::try_unfold(Some(None::<String>), move |cursor| {
            let partition = partition.clone();
            async move {
                let Some(start_after) = cursor else {
                    return Ok::<_, JobError>(None);
                };
                let query = RecordQuery::partition(partition)
                    .start_after(start_after)
                    .limit(page_size);
                let page: Vec<String> = self
                    .ctx
                    .records
                    .query(&query)
                    .await?
                    .into_iter()
                    .map(|record| record.key.sort)
                    .collect();

                let next = if page.len() < page_size {
                    None
                } else {
                    page.last().cloned().map(Some)
                };
                Ok(Some((stream::iter(page.into_iter().map(Ok::<_, JobError>)), next)))
            }
        })
        .try_flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::JobsConfig, services::testing::harness};
    use chrono::Duration;
    use std::sync::Arc;

    async fn collect(registry: &WaiterRegistry, subject: &str) -> Vec<String> {
        registry.list_waiters(subject).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn subscribing_twice_yields_one_waiter() {
        let h = harness().await;
        let registry = WaiterRegistry::new(h.ctx.clone());
        assert!(registry.subscribe("job-1", "w1").await.unwrap());
        assert!(registry.subscribe("job-1", "w1").await.unwrap());
        registry.subscribe("job-2", "w2").await.unwrap();

        assert_eq!(collect(&registry, "job-1").await, vec!["w1"]);
    }

    #[tokio::test]
    async fn empty_waiter_is_a_no_op() {
        let h = harness().await;
        let registry = WaiterRegistry::new(h.ctx.clone());
        assert!(registry.subscribe("job-1", "").await.unwrap());
        assert!(collect(&registry, "job-1").await.is_empty());
    }

    #[tokio::test]
    async fn listing_walks_every_page() {
        let h = harness().await;
        let config = JobsConfig {
            waiter_page_size: 2,
            ..JobsConfig::default()
        };
        let ctx = JobContext {
            config: Arc::new(config),
            ..h.ctx.clone()
        };
        let registry = WaiterRegistry::new(ctx);
        for waiter in ["w5", "w1", "w3", "w2", "w4"] {
            registry.subscribe("job-1", waiter).await.unwrap();
        }

        assert_eq!(collect(&registry, "job-1").await, vec!["w1", "w2", "w3", "w4", "w5"]);

        registry.unsubscribe("job-1", "w2").await.unwrap();
        registry.unsubscribe("job-1", "w3").await.unwrap();
        assert_eq!(collect(&registry, "job-1").await, vec!["w1", "w4", "w5"]);
    }

    #[tokio::test]
    async fn subscriptions_lapse_after_a_day() {
        let h = harness().await;
        let registry = WaiterRegistry::new(h.ctx.clone());
        registry.subscribe("job-1", "w1").await.unwrap();
        h.clock.advance(Duration::hours(23));
        registry.subscribe("job-1", "w2").await.unwrap();

        h.clock.advance(Duration::hours(1));
        assert_eq!(collect(&registry, "job-1").await, vec!["w2"]);
    }
}
