//! Expiry policy and background reclamation.
//!
//! Expiry is decided lazily on every read by [`is_expired`]; that check is
//! authoritative. The [`ExpiryReaper`] only bounds storage growth by removing
//! records (and their blobs) that reads would already refuse.
//!
//! Reclamation trails expiry by a grace period. A resolve that passed the
//! expiry check just before `expire_at` still has to verify the password and
//! open the blob; the grace period keeps the blob in place for that window.

use crate::{
    models::transfer::TransferRecord,
    services::{
        blob_store::BlobStore,
        clock::Clock,
        record_store::{RecordStore, RemovalReason, StoreError},
    },
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A record is expired from `expire_at` onwards.
pub fn is_expired(record: &TransferRecord, now: DateTime<Utc>) -> bool {
    now >= record.expire_at
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ExpiryReaper {
    records: RecordStore,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    batch_size: u32,
    grace: ChronoDuration,
}

impl ExpiryReaper {
    pub fn new(
        records: RecordStore,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        batch_size: u32,
        grace: ChronoDuration,
    ) -> Self {
        Self {
            records,
            blobs,
            clock,
            batch_size,
            grace: grace.max(ChronoDuration::zero()),
        }
    }

    /// Reclaim one batch of transfers that expired at least `grace` ago.
    ///
    /// Blob first, then record. A blob that cannot be removed keeps its
    /// record, so the next sweep retries it. Downloads that already opened
    /// the blob keep reading from their handle.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let cutoff = self.clock.now() - self.grace;
        let expired = self.records.list_expired(cutoff, self.batch_size).await?;
        let mut report = SweepReport::default();

        for record in expired {
            if let Err(err) = self.blobs.delete(&record.storage_path).await {
                warn!(link_id = %record.link_id, "failed to remove expired blob: {}", err);
                report.failed += 1;
                continue;
            }
            match self
                .records
                .delete(&record.link_id, RemovalReason::Expired)
                .await
            {
                Ok(()) => {
                    debug!(link_id = %record.link_id, "reclaimed expired transfer");
                    report.reclaimed += 1;
                }
                // Deleted by its owner in the meantime.
                Err(StoreError::NotFound(_)) => {}
                Err(err) => {
                    warn!(link_id = %record.link_id, "failed to remove expired record: {}", err);
                    report.failed += 1;
                }
            }
        }

        if report.reclaimed > 0 || report.failed > 0 {
            info!(
                reclaimed = report.reclaimed,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("expiry reaper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            warn!("expiry sweep failed: {}", err);
                        }
                    }
                }
            }
        })
    }
}
