use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::store::{Fields, LogRecord};

/// Lifecycle state of a job.
///
/// `Scheduled` is initial; `Success` and `Failure` are terminal. `Error`
/// marks a failed attempt that will be retried; the requeue puts a fresh
/// entry on the job log without an intermediate event, so `Error` admits a
/// direct step back to `InProgress`, and straight to `Failure` once the
/// retry budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    InProgress,
    Success,
    Error,
    Failure,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    /// Whether `to` is reachable from `self` in one transition.
    pub fn can_transition(&self, to: JobState) -> bool {
        matches!(
            (self, to),
            (JobState::Scheduled, JobState::InProgress)
                | (
                    JobState::InProgress,
                    JobState::Success | JobState::Error | JobState::Failure
                )
                | (
                    JobState::Error,
                    JobState::Scheduled | JobState::InProgress | JobState::Failure
                )
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Scheduled => write!(f, "scheduled"),
            JobState::InProgress => write!(f, "in_progress"),
            JobState::Success => write!(f, "success"),
            JobState::Error => write!(f, "error"),
            JobState::Failure => write!(f, "failure"),
        }
    }
}

impl FromStr for JobState {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(JobState::Scheduled),
            "in_progress" => Ok(JobState::InProgress),
            "success" => Ok(JobState::Success),
            "error" => Ok(JobState::Error),
            "failure" => Ok(JobState::Failure),
            other => Err(DispatchError::Internal(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// One compute job as held by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Map<String, Value>,
    #[serde(rename = "gpu")]
    pub required_gpu: String,
    pub retries: u32,
    pub created: DateTime<Utc>,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, required_gpu: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), job_type, required_gpu, payload)
    }

    pub fn with_id(
        id: impl Into<String>,
        job_type: impl Into<String>,
        required_gpu: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            payload,
            required_gpu: required_gpu.into(),
            retries: 0,
            created: Utc::now(),
            state: JobState::Scheduled,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            consumer_id: None,
            result: None,
            error: None,
        }
    }

    /// Fields written to the `job:{id}` metadata hash, one per attribute.
    pub fn to_hash_fields(&self) -> Fields {
        let mut fields = vec![
            ("id".to_string(), self.id.clone()),
            ("type".to_string(), self.job_type.clone()),
            (
                "payload".to_string(),
                Value::Object(self.payload.clone()).to_string(),
            ),
            ("gpu".to_string(), self.required_gpu.clone()),
            ("retries".to_string(), self.retries.to_string()),
            ("created".to_string(), self.created.to_rfc3339()),
            ("state".to_string(), self.state.to_string()),
        ];
        if let Some(consumer_id) = &self.consumer_id {
            fields.push(("consumer_id".to_string(), consumer_id.clone()));
        }
        if let Some(error) = &self.error {
            fields.push(("error".to_string(), error.clone()));
        }
        fields
    }

    /// Rebuild a job from its metadata hash.
    pub fn from_hash(fields: &HashMap<String, String>) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            fields.get(name).cloned().ok_or_else(|| {
                DispatchError::Internal(format!("job metadata missing field {name}"))
            })
        };
        let timestamp = |name: &str| -> Option<DateTime<Utc>> {
            fields
                .get(name)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|ts| ts.with_timezone(&Utc))
        };

        let payload = match fields.get("payload") {
            Some(raw) => match serde_json::from_str::<Value>(raw)? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            None => Map::new(),
        };
        let created = timestamp("created").ok_or_else(|| {
            DispatchError::Internal("job metadata missing field created".to_string())
        })?;
        let result = fields
            .get("result")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            });

        Ok(Self {
            id: required("id")?,
            job_type: required("type")?,
            payload,
            required_gpu: fields.get("gpu").cloned().unwrap_or_default(),
            retries: fields
                .get("retries")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            created,
            state: required("state")?.parse()?,
            assigned_at: timestamp("assigned_at"),
            started_at: timestamp("started_at"),
            completed_at: timestamp("completed_at"),
            consumer_id: fields.get("consumer_id").cloned(),
            result,
            error: fields.get("error").cloned(),
        })
    }
}

/// One lifecycle transition on the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub state: JobState,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "supervisor")]
    pub supervisor_id: String,
    pub gpu_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
}

impl JobEvent {
    pub fn new(
        job_id: impl Into<String>,
        state: JobState,
        supervisor_id: impl Into<String>,
        gpu_type: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            timestamp: Utc::now(),
            supervisor_id: supervisor_id.into(),
            gpu_type: gpu_type.into(),
            error: None,
            result: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_result(mut self, result: Map<String, Value>) -> Self {
        self.result = Some(result);
        self
    }

    /// Flat stream-entry encoding.
    pub fn to_fields(&self) -> Fields {
        let mut fields = vec![
            ("job_id".to_string(), self.job_id.clone()),
            ("state".to_string(), self.state.to_string()),
            ("timestamp".to_string(), self.timestamp.to_rfc3339()),
            ("supervisor".to_string(), self.supervisor_id.clone()),
            ("gpu_type".to_string(), self.gpu_type.clone()),
        ];
        if let Some(error) = &self.error {
            fields.push(("error".to_string(), error.clone()));
        }
        if let Some(result) = &self.result {
            fields.push((
                "result".to_string(),
                Value::Object(result.clone()).to_string(),
            ));
        }
        fields
    }

    /// Decode an event from a stream record.
    pub fn from_record(record: &LogRecord) -> Result<Self> {
        let required = |name: &str| -> Result<String> {
            record.field(name).map(str::to_string).ok_or_else(|| {
                DispatchError::MalformedMessage {
                    entry_id: record.entry_id.clone(),
                    reason: format!("missing field {name}"),
                }
            })
        };

        let timestamp = DateTime::parse_from_rfc3339(&required("timestamp")?)
            .map_err(|e| DispatchError::MalformedMessage {
                entry_id: record.entry_id.clone(),
                reason: format!("bad timestamp: {e}"),
            })?
            .with_timezone(&Utc);
        let result = record
            .field("result")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            });

        Ok(Self {
            job_id: required("job_id")?,
            state: required("state")?
                .parse()
                .map_err(|_| DispatchError::MalformedMessage {
                    entry_id: record.entry_id.clone(),
                    reason: "bad state".to_string(),
                })?,
            timestamp,
            supervisor_id: required("supervisor")?,
            gpu_type: record.field("gpu_type").unwrap_or_default().to_string(),
            error: record.field("error").map(str::to_string),
            result,
        })
    }
}
