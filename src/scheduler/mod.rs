//! Job intake and event mirroring.
//!
//! The [`Scheduler`] turns submissions into a durable pair of writes: a log
//! entry on the job stream and a metadata record, committed in one atomic
//! batch. The [`EventMirror`](mirror::EventMirror) folds lifecycle events
//! back into the metadata records, keeping a single writer per field.

pub mod job;
pub mod mirror;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{DispatchError, Result};
use crate::store::{job_key, EntryId, Store, JOB_INDEX_KEY, JOB_STREAM};

pub use job::{Job, JobEvent, JobState};
pub use mirror::EventMirror;

pub struct Scheduler {
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Enqueue a new job, returning its id.
    pub async fn enqueue(
        &self,
        job_type: &str,
        required_gpu: &str,
        payload: Map<String, Value>,
    ) -> Result<String> {
        self.enqueue_job(Job::new(job_type, required_gpu, payload))
            .await
    }

    /// Enqueue a job carrying its own id.
    ///
    /// If a metadata record for the id already exists the call is a no-op
    /// returning the existing id, so retried submissions cannot produce a
    /// second record or a second log entry.
    pub async fn enqueue_job(&self, job: Job) -> Result<String> {
        let key = job_key(&job.id);
        if self.store.hash_exists(&key, "id").await? {
            tracing::debug!(job_id = %job.id, "Job already enqueued, returning existing id");
            return Ok(job.id);
        }

        let entry_fields = vec![
            ("job_id".to_string(), job.id.clone()),
            (
                "payload".to_string(),
                Value::Object(job.payload.clone()).to_string(),
            ),
            ("state".to_string(), job.state.to_string()),
        ];
        self.store
            .append_with_hash(
                JOB_STREAM,
                entry_fields,
                &key,
                job.to_hash_fields(),
                JOB_INDEX_KEY,
                &job.id,
                &job.state.to_string(),
            )
            .await
            .map_err(|e| DispatchError::Enqueue(e.to_string()))?;

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            gpu = %job.required_gpu,
            "Job enqueued"
        );
        Ok(job.id)
    }

    /// Put a fresh log entry for an existing job back on the stream.
    ///
    /// This is the retry path: the metadata record (and with it the retry
    /// counter) is preserved, only the log entry is new.
    pub async fn requeue(&self, job: &Job) -> Result<EntryId> {
        let entry_fields = vec![
            ("job_id".to_string(), job.id.clone()),
            (
                "payload".to_string(),
                Value::Object(job.payload.clone()).to_string(),
            ),
            ("state".to_string(), JobState::Scheduled.to_string()),
        ];
        let entry_id = self.store.append(JOB_STREAM, entry_fields).await?;
        tracing::info!(job_id = %job.id, entry_id = %entry_id, "Job requeued");
        Ok(entry_id)
    }

    /// Drop the metadata record of a terminal job.
    ///
    /// Records are retained until explicitly purged; purging a job that is
    /// still in flight is refused.
    pub async fn purge_job(&self, job_id: &str) -> Result<()> {
        let key = job_key(job_id);
        let fields = self.store.hash_get_all(&key).await?;
        if fields.is_empty() {
            return Err(DispatchError::JobNotFound(job_id.to_string()));
        }
        let job = Job::from_hash(&fields)?;
        if !job.state.is_terminal() {
            return Err(DispatchError::Internal(format!(
                "job {job_id} is not terminal (state {})",
                job.state
            )));
        }
        self.store.delete_key(&key).await?;
        self.store.hash_delete_field(JOB_INDEX_KEY, job_id).await?;
        tracing::info!(job_id = %job_id, "Job purged");
        Ok(())
    }
}
