//! Periodic removal of expired records.
//!
//! Reads already hide expired rows; sweeping only reclaims the space.

use crate::services::record_store::{RecordStore, StoreResult};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Reaper {
    records: Arc<dyn RecordStore>,
    interval: Duration,
}

impl Reaper {
    pub fn new(records: Arc<dyn RecordStore>, interval: Duration) -> Self {
        Self { records, interval }
    }

    /// Delete every expired record once. Returns how many were removed.
    pub async fn sweep(&self) -> StoreResult<u64> {
        let removed = self.records.purge_expired().await?;
        if removed > 0 {
            info!(removed, "reaped expired records");
        } else {
            debug!("no expired records");
        }
        Ok(removed)
    }

    /// Sweep on a fixed interval until the task is aborted. A failed sweep is
    /// logged and retried on the next tick.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "reaper started");
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep().await {
                    warn!(error = %err, "reaper sweep failed");
                }
            }
        })
    }
}
