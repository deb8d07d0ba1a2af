//! Long-running worker bound to one accelerator class.
//!
//! A supervisor competitively claims entries from the job log through the
//! shared consumer group, filters them by GPU affinity, runs the executor,
//! and publishes every lifecycle transition to the event stream. It never
//! writes job metadata directly; the scheduler's mirror owns that.

pub mod executor;
pub mod heartbeat;
pub mod reclaim;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::scheduler::{Job, JobEvent, JobState, Scheduler};
use crate::store::{job_key, LogRecord, Store, EVENT_STREAM, JOB_STREAM, WORKER_GROUP};

pub use executor::{ExecutionOutcome, Executor, SimulatedExecutor};
pub use heartbeat::HeartbeatLoop;
pub use reclaim::ReclaimLoop;

/// Pause after a failed read before the next loop iteration.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Supervisor {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    executor: Arc<dyn Executor>,
    consumer_id: String,
    gpu_type: String,
    max_retries: u32,
    retry_delay: Duration,
    read_block_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Arc<Scheduler>,
        executor: Arc<dyn Executor>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            scheduler,
            executor,
            consumer_id: config.consumer_id.clone(),
            gpu_type: config.gpu_type.clone(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            read_block_timeout: config.read_block_timeout,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn gpu_type(&self) -> &str {
        &self.gpu_type
    }

    /// Create the worker group on the job log. A pre-existing group is fine;
    /// any other failure is fatal at startup.
    pub async fn ensure_group(&self) -> Result<()> {
        self.store.create_group(JOB_STREAM, WORKER_GROUP).await
    }

    /// Main loop: read one entry at a time, handle it, repeat until the
    /// token is cancelled. An in-flight handler always runs to completion.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(
            consumer_id = %self.consumer_id,
            gpu_type = %self.gpu_type,
            "Supervisor started"
        );

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                res = self.store.read_group(
                    JOB_STREAM,
                    WORKER_GROUP,
                    &self.consumer_id,
                    self.read_block_timeout,
                ) => res,
            };

            match read {
                Ok(Some(record)) => self.handle_record(record).await,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Error reading from job log");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!(consumer_id = %self.consumer_id, "Supervisor stopped");
    }

    /// Handle one delivered log entry.
    ///
    /// Entries this supervisor cannot decode or resolve are acknowledged
    /// and dropped. Entries whose job requires a different accelerator are
    /// left unacknowledged so a matching supervisor can reclaim them.
    pub async fn handle_record(&self, record: LogRecord) {
        let Some(job_id) = record.field("job_id").map(str::to_string) else {
            tracing::warn!(entry_id = %record.entry_id, "Log entry missing job_id, dropping");
            self.ack_entry(&record.entry_id).await;
            return;
        };
        let payload_ok = record
            .field("payload")
            .map(|raw| serde_json::from_str::<serde_json::Value>(raw).is_ok())
            .unwrap_or(false);
        if !payload_ok {
            tracing::warn!(
                entry_id = %record.entry_id,
                job_id = %job_id,
                "Log entry carries unparseable payload, dropping"
            );
            self.ack_entry(&record.entry_id).await;
            return;
        }

        let fields = match self.store.hash_get_all(&job_key(&job_id)).await {
            Ok(fields) => fields,
            Err(e) => {
                // Transient store failure: leave the entry pending so it is
                // redelivered through claim recovery.
                tracing::error!(job_id = %job_id, error = %e, "Failed to load job metadata");
                return;
            }
        };
        if fields.is_empty() {
            tracing::warn!(job_id = %job_id, "Job metadata not found, dropping entry");
            self.ack_entry(&record.entry_id).await;
            return;
        }
        let job = match Job::from_hash(&fields) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Corrupt job metadata, dropping entry");
                self.ack_entry(&record.entry_id).await;
                return;
            }
        };

        if job.state.is_terminal() {
            tracing::debug!(job_id = %job.id, state = %job.state, "Job already terminal, dropping entry");
            self.ack_entry(&record.entry_id).await;
            return;
        }

        if !self.can_handle(&job) {
            tracing::info!(
                job_id = %job.id,
                required_gpu = %job.required_gpu,
                supervisor_gpu = %self.gpu_type,
                "Skipping job due to GPU mismatch"
            );
            // No ack: the entry stays pending for reclaim by a matching
            // supervisor.
            return;
        }

        // A delivery for a job whose retry budget is already spent fails it
        // without another execution.
        if job.retries >= self.max_retries && job.state == JobState::Error {
            let error = job
                .error
                .clone()
                .unwrap_or_else(|| "retry budget exhausted".to_string());
            self.emit(
                JobEvent::new(&job.id, JobState::Failure, &self.consumer_id, &self.gpu_type)
                    .with_error(&error),
            )
            .await;
            self.ack_entry(&record.entry_id).await;
            tracing::warn!(
                job_id = %job.id,
                retries = job.retries,
                "Job failed permanently"
            );
            return;
        }

        self.emit(JobEvent::new(
            &job.id,
            JobState::InProgress,
            &self.consumer_id,
            &self.gpu_type,
        ))
        .await;

        match self.executor.execute(&job).await {
            ExecutionOutcome::Ok(result) => {
                self.emit(
                    JobEvent::new(&job.id, JobState::Success, &self.consumer_id, &self.gpu_type)
                        .with_result(result),
                )
                .await;
                self.ack_entry(&record.entry_id).await;
                tracing::info!(job_id = %job.id, "Job completed successfully");
            }
            ExecutionOutcome::Failed(error) => {
                if job.retries < self.max_retries {
                    self.emit(
                        JobEvent::new(&job.id, JobState::Error, &self.consumer_id, &self.gpu_type)
                            .with_error(&error),
                    )
                    .await;
                    tracing::warn!(
                        job_id = %job.id,
                        retries = job.retries + 1,
                        max_retries = self.max_retries,
                        error = %error,
                        "Job failed, will retry"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    match self.scheduler.requeue(&job).await {
                        Ok(_) => self.ack_entry(&record.entry_id).await,
                        Err(e) => {
                            // Keep the entry pending; redelivery retries it.
                            tracing::error!(job_id = %job.id, error = %e, "Failed to requeue job");
                        }
                    }
                } else {
                    self.emit(
                        JobEvent::new(
                            &job.id,
                            JobState::Failure,
                            &self.consumer_id,
                            &self.gpu_type,
                        )
                        .with_error(&error),
                    )
                    .await;
                    self.ack_entry(&record.entry_id).await;
                    tracing::warn!(
                        job_id = %job.id,
                        retries = job.retries,
                        error = %error,
                        "Job failed permanently"
                    );
                }
            }
        }
    }

    /// A job with an empty GPU requirement runs anywhere; otherwise the tag
    /// must equal this supervisor's class.
    fn can_handle(&self, job: &Job) -> bool {
        job.required_gpu.is_empty() || job.required_gpu == self.gpu_type
    }

    async fn emit(&self, event: JobEvent) {
        if let Err(e) = self.store.append(EVENT_STREAM, event.to_fields()).await {
            tracing::error!(
                job_id = %event.job_id,
                state = %event.state,
                error = %e,
                "Failed to emit job event"
            );
        } else {
            tracing::debug!(job_id = %event.job_id, state = %event.state, "Emitted job event");
        }
    }

    async fn ack_entry(&self, entry_id: &str) {
        if let Err(e) = self.store.ack(JOB_STREAM, WORKER_GROUP, entry_id).await {
            tracing::error!(entry_id = %entry_id, error = %e, "Failed to ack log entry");
        }
    }
}
