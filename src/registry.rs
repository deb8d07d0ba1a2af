//! Read-side view over the metadata store.
//!
//! The registry owns no state of its own; every operation projects over the
//! supervisor-status hash and the per-job metadata hashes. Supervisors
//! write their own status through it (heartbeat); everything else is reads.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::scheduler::{Job, JobState};
use crate::store::{job_key, Store, JOB_INDEX_KEY, SUPERVISOR_STATUS_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Active,
    Inactive,
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Active => write!(f, "active"),
            SupervisorState::Inactive => write!(f, "inactive"),
            SupervisorState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub consumer_id: String,
    pub gpu_type: String,
    pub state: SupervisorState,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct StatusRegistry {
    store: Arc<dyn Store>,
    active_window: Duration,
}

impl StatusRegistry {
    pub fn new(store: Arc<dyn Store>, active_window: Duration) -> Self {
        Self {
            store,
            active_window,
        }
    }

    pub async fn get_supervisor(&self, consumer_id: &str) -> Result<SupervisorStatus> {
        let raw = self
            .store
            .hash_get(SUPERVISOR_STATUS_KEY, consumer_id)
            .await?
            .ok_or_else(|| DispatchError::SupervisorNotFound(consumer_id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn get_all_supervisors(&self) -> Result<Vec<SupervisorStatus>> {
        let raw = self.store.hash_get_all(SUPERVISOR_STATUS_KEY).await?;
        let mut supervisors = Vec::with_capacity(raw.len());
        for (consumer_id, value) in raw {
            match serde_json::from_str::<SupervisorStatus>(&value) {
                Ok(status) => supervisors.push(status),
                Err(e) => {
                    tracing::warn!(
                        consumer_id = %consumer_id,
                        error = %e,
                        "Skipping undecodable supervisor status"
                    );
                }
            }
        }
        Ok(supervisors)
    }

    /// Supervisors that report `active` and whose last heartbeat is within
    /// the active window. A crashed supervisor drops out of this listing
    /// once its `last_seen` ages past the window.
    pub async fn get_active_supervisors(&self) -> Result<Vec<SupervisorStatus>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.active_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Ok(self
            .get_all_supervisors()
            .await?
            .into_iter()
            .filter(|s| s.state == SupervisorState::Active && s.last_seen >= cutoff)
            .collect())
    }

    /// Heartbeat writer. Stores the status verbatim.
    pub async fn update_supervisor_status(&self, status: &SupervisorStatus) -> Result<()> {
        let encoded = serde_json::to_string(status)?;
        self.store
            .hash_set(SUPERVISOR_STATUS_KEY, &status.consumer_id, &encoded)
            .await?;
        tracing::debug!(
            consumer_id = %status.consumer_id,
            state = %status.state,
            "Supervisor status updated"
        );
        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let fields = self.store.hash_get_all(&job_key(job_id)).await?;
        if fields.is_empty() {
            return Err(DispatchError::JobNotFound(job_id.to_string()));
        }
        Job::from_hash(&fields)
    }

    /// All jobs currently in `state`, resolved through the job index.
    pub async fn get_jobs_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let index = self.store.hash_get_all(JOB_INDEX_KEY).await?;
        let mut jobs = Vec::new();
        for (job_id, indexed_state) in index {
            if indexed_state != state.to_string() {
                continue;
            }
            match self.get_job(&job_id).await {
                Ok(job) => jobs.push(job),
                // Index and record can briefly disagree around a purge.
                Err(DispatchError::JobNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }
}
