use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::scheduler::Job;

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Ok(Map<String, Value>),
    Failed(String),
}

/// The accelerator runtime boundary.
///
/// The dispatcher treats execution as opaque: a job goes in, an outcome
/// comes out. Implementations must be safe to call repeatedly for the same
/// job since delivery is at-least-once.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> ExecutionOutcome;
}

/// Default executor simulating accelerator workloads by job type.
///
/// `fail` always fails, `sleep` waits for `duration_ms` from the payload,
/// anything else completes after a short delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedExecutor;

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn execute(&self, job: &Job) -> ExecutionOutcome {
        tracing::info!(job_id = %job.id, job_type = %job.job_type, "Executing job");

        match job.job_type.as_str() {
            "fail" => ExecutionOutcome::Failed("simulated failure".to_string()),
            "sleep" => {
                let duration_ms = job
                    .payload
                    .get("duration_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                let mut result = Map::new();
                result.insert("slept_ms".to_string(), Value::from(duration_ms));
                ExecutionOutcome::Ok(result)
            }
            _ => {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let mut result = Map::new();
                result.insert(
                    "output".to_string(),
                    Value::from(format!("{} completed", job.job_type)),
                );
                ExecutionOutcome::Ok(result)
            }
        }
    }
}
