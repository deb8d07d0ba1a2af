use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::registry::{StatusRegistry, SupervisorState, SupervisorStatus};

/// Keeps this supervisor's status record fresh.
///
/// Writes an `active` status on start and on every interval tick, and a
/// final `inactive` one when the loop drains. Readers treat a status whose
/// `last_seen` has aged past the active window as stale regardless.
pub struct HeartbeatLoop {
    registry: Arc<StatusRegistry>,
    consumer_id: String,
    gpu_type: String,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(registry: Arc<StatusRegistry>, config: &Config) -> Self {
        Self {
            registry,
            consumer_id: config.consumer_id.clone(),
            gpu_type: config.gpu_type.clone(),
            interval: config.heartbeat_interval,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let started_at = Utc::now();
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let status = SupervisorStatus {
                        consumer_id: self.consumer_id.clone(),
                        gpu_type: self.gpu_type.clone(),
                        state: SupervisorState::Active,
                        started_at,
                        last_seen: Utc::now(),
                    };
                    if let Err(e) = self.registry.update_supervisor_status(&status).await {
                        tracing::warn!(
                            consumer_id = %self.consumer_id,
                            error = %e,
                            "Heartbeat update failed"
                        );
                    }
                }
            }
        }

        let parting = SupervisorStatus {
            consumer_id: self.consumer_id.clone(),
            gpu_type: self.gpu_type.clone(),
            state: SupervisorState::Inactive,
            started_at,
            last_seen: Utc::now(),
        };
        if let Err(e) = self.registry.update_supervisor_status(&parting).await {
            tracing::warn!(
                consumer_id = %self.consumer_id,
                error = %e,
                "Final status update failed"
            );
        }
        tracing::info!(consumer_id = %self.consumer_id, "Heartbeat stopped");
    }
}
