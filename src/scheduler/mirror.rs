use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{Job, JobEvent, JobState};
use crate::store::{job_key, LogRecord, Store, EVENT_STREAM, JOB_INDEX_KEY};

const READ_BLOCK: Duration = Duration::from_secs(2);
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// Tails the event stream and patches job metadata.
///
/// The mirror is the only writer of job state outside of enqueue, which
/// keeps one writer per record: supervisors publish transitions, the mirror
/// applies them. One instance runs per deployment.
pub struct EventMirror {
    store: Arc<dyn Store>,
}

impl EventMirror {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Run until cancelled, starting at the current tail of the stream.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!("Event mirror started");

        let mut last_id = match self.resolve_tail(&token).await {
            Some(id) => id,
            None => return,
        };
        let mut backoff = BACKOFF_BASE;

        'run: loop {
            let records = tokio::select! {
                _ = token.cancelled() => break 'run,
                res = self.store.read_stream(EVENT_STREAM, &last_id, READ_BLOCK) => res,
            };

            match records {
                Ok(records) => {
                    for record in records {
                        match self.apply_record(&record).await {
                            Ok(()) => {
                                last_id = record.entry_id.clone();
                                backoff = BACKOFF_BASE;
                            }
                            Err(e) => {
                                // Transient store failure: back off and
                                // re-read from the last applied id so this
                                // record is delivered again.
                                tracing::warn!(
                                    entry_id = %record.entry_id,
                                    error = %e,
                                    "Failed to apply event, backing off"
                                );
                                tokio::select! {
                                    _ = token.cancelled() => break 'run,
                                    _ = tokio::time::sleep(backoff) => {}
                                }
                                backoff = (backoff * 2).min(BACKOFF_MAX);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Event mirror read failed, backing off");
                    tokio::select! {
                        _ = token.cancelled() => break 'run,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        tracing::info!("Event mirror stopped");
    }

    async fn resolve_tail(&self, token: &CancellationToken) -> Option<String> {
        let mut backoff = BACKOFF_BASE;
        loop {
            match self.store.latest_entry_id(EVENT_STREAM).await {
                Ok(id) => return Some(id),
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot resolve event stream tail, retrying");
                    tokio::select! {
                        _ = token.cancelled() => return None,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
            }
        }
    }

    /// Apply one stream record. `Ok` means the loop may advance past it
    /// (including skips); `Err` is a transient store failure worth a retry.
    async fn apply_record(&self, record: &LogRecord) -> Result<()> {
        let event = match JobEvent::from_record(record) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(entry_id = %record.entry_id, error = %e, "Dropping malformed event");
                return Ok(());
            }
        };
        match self.apply_event(&event).await {
            Ok(()) => Ok(()),
            Err(DispatchError::UnknownJob(job_id)) => {
                tracing::warn!(job_id = %job_id, "Event references unknown job, skipping");
                Ok(())
            }
            Err(DispatchError::Store(e)) => Err(DispatchError::Store(e)),
            Err(e) => {
                tracing::warn!(job_id = %event.job_id, error = %e, "Failed to apply event, skipping");
                Ok(())
            }
        }
    }

    /// Apply one lifecycle event to the job's metadata record.
    ///
    /// Transitions whose target is unreachable from the record's current
    /// state are ignored, which makes event replay idempotent and keeps
    /// terminal records frozen.
    pub async fn apply_event(&self, event: &JobEvent) -> Result<()> {
        let key = job_key(&event.job_id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Err(DispatchError::UnknownJob(event.job_id.clone()));
        }
        let job = Job::from_hash(&fields)?;

        if !job.state.can_transition(event.state) {
            tracing::warn!(
                job_id = %event.job_id,
                from = %job.state,
                to = %event.state,
                "Ignoring unreachable transition"
            );
            return Ok(());
        }

        let mut updates = vec![
            ("state".to_string(), event.state.to_string()),
            ("updated_at".to_string(), Utc::now().to_rfc3339()),
        ];
        match event.state {
            JobState::InProgress => {
                updates.push(("consumer_id".to_string(), event.supervisor_id.clone()));
                updates.push(("assigned_at".to_string(), event.timestamp.to_rfc3339()));
                updates.push(("started_at".to_string(), event.timestamp.to_rfc3339()));
            }
            JobState::Success => {
                updates.push(("completed_at".to_string(), event.timestamp.to_rfc3339()));
                if let Some(result) = &event.result {
                    updates.push((
                        "result".to_string(),
                        Value::Object(result.clone()).to_string(),
                    ));
                }
            }
            JobState::Error => {
                updates.push(("retries".to_string(), (job.retries + 1).to_string()));
                if let Some(error) = &event.error {
                    updates.push(("error".to_string(), error.clone()));
                }
            }
            JobState::Failure => {
                updates.push(("completed_at".to_string(), event.timestamp.to_rfc3339()));
                if let Some(error) = &event.error {
                    updates.push(("error".to_string(), error.clone()));
                }
            }
            JobState::Scheduled => {}
        }

        self.store.hash_set_all(&key, updates).await?;
        self.store
            .hash_set(JOB_INDEX_KEY, &event.job_id, &event.state.to_string())
            .await?;

        tracing::debug!(
            job_id = %event.job_id,
            state = %event.state,
            supervisor = %event.supervisor_id,
            "Applied job event"
        );
        Ok(())
    }
}
