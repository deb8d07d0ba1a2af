//! Job state machine tests.

use std::collections::HashMap;

use serde_json::{Map, Value};

use gpuflow::scheduler::{Job, JobEvent, JobState};
use gpuflow::store::LogRecord;

#[test]
fn scheduled_is_initial_and_not_terminal() {
    let job = Job::new("train", "AMD", Map::new());
    assert_eq!(job.state, JobState::Scheduled);
    assert_eq!(job.retries, 0);
    assert!(!job.state.is_terminal());
    assert!(job.consumer_id.is_none());
}

#[test]
fn transitions_follow_the_lifecycle_dag() {
    assert!(JobState::Scheduled.can_transition(JobState::InProgress));
    assert!(JobState::InProgress.can_transition(JobState::Success));
    assert!(JobState::InProgress.can_transition(JobState::Error));
    assert!(JobState::InProgress.can_transition(JobState::Failure));
    assert!(JobState::Error.can_transition(JobState::Scheduled));
    assert!(JobState::Error.can_transition(JobState::InProgress));
    assert!(JobState::Error.can_transition(JobState::Failure));

    // No skipping the claim.
    assert!(!JobState::Scheduled.can_transition(JobState::Success));
    assert!(!JobState::Scheduled.can_transition(JobState::Failure));
    // No self-loops.
    assert!(!JobState::InProgress.can_transition(JobState::InProgress));
}

#[test]
fn terminal_states_admit_nothing() {
    for terminal in [JobState::Success, JobState::Failure] {
        assert!(terminal.is_terminal());
        for target in [
            JobState::Scheduled,
            JobState::InProgress,
            JobState::Success,
            JobState::Error,
            JobState::Failure,
        ] {
            assert!(
                !terminal.can_transition(target),
                "{terminal} must not transition to {target}"
            );
        }
    }
}

#[test]
fn state_display_round_trips_through_parse() {
    for state in [
        JobState::Scheduled,
        JobState::InProgress,
        JobState::Success,
        JobState::Error,
        JobState::Failure,
    ] {
        let parsed: JobState = state.to_string().parse().expect("parse back");
        assert_eq!(parsed, state);
    }
    assert!("running".parse::<JobState>().is_err());
}

#[test]
fn job_round_trips_through_hash_fields() {
    let mut payload = Map::new();
    payload.insert("task_id".to_string(), Value::from(7));
    let mut job = Job::new("train", "NVIDIA", payload);
    job.retries = 2;
    job.error = Some("transient".to_string());

    let fields: HashMap<String, String> = job.to_hash_fields().into_iter().collect();
    let restored = Job::from_hash(&fields).expect("restore");

    assert_eq!(restored.id, job.id);
    assert_eq!(restored.job_type, "train");
    assert_eq!(restored.required_gpu, "NVIDIA");
    assert_eq!(restored.retries, 2);
    assert_eq!(restored.state, JobState::Scheduled);
    assert_eq!(restored.payload.get("task_id"), Some(&Value::from(7)));
    assert_eq!(restored.error.as_deref(), Some("transient"));
}

#[test]
fn job_from_hash_rejects_missing_fields() {
    let fields = HashMap::from([("id".to_string(), "j1".to_string())]);
    assert!(Job::from_hash(&fields).is_err());
}

#[test]
fn event_round_trips_through_stream_fields() {
    let mut result = Map::new();
    result.insert("output".to_string(), Value::from("done"));
    let event = JobEvent::new("j1", JobState::Success, "w_amd", "AMD").with_result(result);

    let record = LogRecord {
        entry_id: "1-0".to_string(),
        fields: event.to_fields().into_iter().collect(),
    };
    let decoded = JobEvent::from_record(&record).expect("decode");

    assert_eq!(decoded.job_id, "j1");
    assert_eq!(decoded.state, JobState::Success);
    assert_eq!(decoded.supervisor_id, "w_amd");
    assert_eq!(decoded.gpu_type, "AMD");
    assert_eq!(
        decoded.result.and_then(|r| r.get("output").cloned()),
        Some(Value::from("done"))
    );
}

#[test]
fn event_decode_rejects_missing_fields() {
    let record = LogRecord {
        entry_id: "1-0".to_string(),
        fields: HashMap::from([("state".to_string(), "success".to_string())]),
    };
    assert!(JobEvent::from_record(&record).is_err());
}
