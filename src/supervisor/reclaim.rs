use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::store::{job_key, EntryId, Store, JOB_STREAM, WORKER_GROUP};
use crate::supervisor::Supervisor;

/// Recovers pending entries stranded by crashed or mismatched supervisors.
///
/// The affinity filter leaves entries this supervisor cannot run sitting in
/// the pending set of whichever consumer read them; a crashed supervisor
/// leaves its claims dangling the same way. This loop periodically scans
/// the group's pending entries and re-claims those that (a) have been idle
/// past the pending timeout, (b) belong to a different consumer, and (c)
/// require this supervisor's accelerator class or none at all. Claimed
/// entries go through the normal handling path.
pub struct ReclaimLoop {
    store: Arc<dyn Store>,
    supervisor: Arc<Supervisor>,
    interval: Duration,
    pending_timeout: Duration,
    batch: usize,
}

impl ReclaimLoop {
    pub fn new(store: Arc<dyn Store>, supervisor: Arc<Supervisor>, config: &Config) -> Self {
        Self {
            store,
            supervisor,
            interval: config.reclaim_interval,
            pending_timeout: config.pending_timeout,
            batch: config.reclaim_batch,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once().await {
                        tracing::warn!(error = %e, "Pending-entry scan failed");
                    }
                }
            }
        }
        tracing::info!(consumer_id = %self.supervisor.consumer_id(), "Reclaim loop stopped");
    }

    /// One scan over the pending-entries list. Returns how many entries
    /// were reclaimed and handled.
    pub async fn scan_once(&self) -> Result<usize> {
        let pending = self
            .store
            .pending(JOB_STREAM, WORKER_GROUP, self.pending_timeout, self.batch)
            .await?;

        let mut to_claim: Vec<EntryId> = Vec::new();
        for entry in pending {
            if entry.consumer == self.supervisor.consumer_id() {
                continue;
            }
            let Some(record) = self.store.entry(JOB_STREAM, &entry.entry_id).await? else {
                continue;
            };
            let Some(job_id) = record.field("job_id") else {
                // Malformed entries are claimed so the handler acks them away.
                to_claim.push(entry.entry_id);
                continue;
            };
            let fields = self.store.hash_get_all(&job_key(job_id)).await?;
            if fields.is_empty() {
                // Unknown job: claim and let the handler drop it.
                to_claim.push(entry.entry_id);
                continue;
            }
            let required_gpu = fields.get("gpu").map(String::as_str).unwrap_or("");
            if required_gpu.is_empty() || required_gpu == self.supervisor.gpu_type() {
                to_claim.push(entry.entry_id);
            }
        }

        if to_claim.is_empty() {
            return Ok(0);
        }

        let records = self
            .store
            .claim(
                JOB_STREAM,
                WORKER_GROUP,
                self.supervisor.consumer_id(),
                self.pending_timeout,
                &to_claim,
            )
            .await?;

        let reclaimed = records.len();
        for record in records {
            tracing::info!(
                entry_id = %record.entry_id,
                consumer_id = %self.supervisor.consumer_id(),
                "Reclaimed pending entry"
            );
            self.supervisor.handle_record(record).await;
        }
        Ok(reclaimed)
    }
}
