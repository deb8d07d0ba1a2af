//! End-to-end supervisor scenarios over the in-memory store: affinity
//! routing, wildcard jobs, retry exhaustion, and mixed-fleet dispatch.


use std::time::Duration;

use serde_json::Map;

use gpuflow::scheduler::JobState;
use gpuflow::store::{Store, JOB_STREAM, WORKER_GROUP};
use test_harness::{assert_eventually, task_payload, TestPipeline, WAIT};

/// A job tagged AMD lands on the AMD supervisor and never touches the
/// NVIDIA one.
#[tokio::test]
async fn gpu_tagged_job_completes_on_matching_supervisor() {
    let pipeline = TestPipeline::new();
    let w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;
    let w_nv = pipeline.spawn_supervisor("w_nv", "NVIDIA").await;
    let _amd_reclaim = pipeline.spawn_reclaim(&w_amd);
    let _nv_reclaim = pipeline.spawn_reclaim(&w_nv);

    let job_id = pipeline.enqueue("train", "AMD", task_payload(1)).await;

    assert_eventually(
        || async { pipeline.job_state(&job_id).await == Some(JobState::Success) },
        WAIT,
        "AMD job should reach success",
    )
    .await;

    let events = pipeline.events_for(&job_id).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].state, JobState::InProgress);
    assert_eq!(events[0].supervisor_id, "w_amd");
    assert_eq!(events[1].state, JobState::Success);
    assert_eq!(events[1].supervisor_id, "w_amd");

    assert_eq!(w_amd.executions(), vec![job_id]);
    assert!(w_nv.executions().is_empty());
}

/// A job with no GPU requirement may be claimed by any supervisor, but by
/// exactly one.
#[tokio::test]
async fn wildcard_job_executes_exactly_once() {
    let pipeline = TestPipeline::new();
    let w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;
    let w_nv = pipeline.spawn_supervisor("w_nv", "NVIDIA").await;

    let job_id = pipeline.enqueue("t", "", Map::new()).await;

    assert_eventually(
        || async { pipeline.job_state(&job_id).await == Some(JobState::Success) },
        WAIT,
        "wildcard job should reach success",
    )
    .await;

    let events = pipeline.events_for(&job_id).await;
    let successes = events
        .iter()
        .filter(|e| e.state == JobState::Success)
        .count();
    assert_eq!(successes, 1);

    let total_executions = w_amd.executions().len() + w_nv.executions().len();
    assert_eq!(total_executions, 1, "exactly one supervisor may execute");
}

/// A permanently failing job burns its whole retry budget, then fails.
///
/// With MaxRetries = 3 the executor runs three times and the event stream
/// reads InProgress, Error, InProgress, Error, InProgress, Error, Failure.
#[tokio::test]
async fn failing_job_exhausts_retries_then_fails() {
    let pipeline = TestPipeline::new();
    let w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;

    let job_id = pipeline.enqueue("fail", "AMD", Map::new()).await;

    assert_eventually(
        || async { pipeline.job_state(&job_id).await == Some(JobState::Failure) },
        WAIT,
        "failing job should reach failure",
    )
    .await;

    let states: Vec<JobState> = pipeline
        .events_for(&job_id)
        .await
        .iter()
        .map(|e| e.state)
        .collect();
    assert_eq!(
        states,
        vec![
            JobState::InProgress,
            JobState::Error,
            JobState::InProgress,
            JobState::Error,
            JobState::InProgress,
            JobState::Error,
            JobState::Failure,
        ]
    );
    assert_eq!(w_amd.executions().len(), 3);

    let job = pipeline.job(&job_id).await.expect("job");
    assert_eq!(job.state, JobState::Failure);
    assert_eq!(job.retries, 3);
    assert!(job.error.is_some());
    assert!(job.result.is_none());
}

/// Ten jobs across three accelerator classes against a lone class-A
/// supervisor: A jobs finish, the rest stay scheduled and untouched.
#[tokio::test]
async fn mismatched_jobs_wait_for_a_matching_supervisor() {
    let pipeline = TestPipeline::new();
    let w_a = pipeline.spawn_supervisor("w_a", "A").await;
    let _reclaim = pipeline.spawn_reclaim(&w_a);

    let classes = ["A", "B", "C"];
    let mut a_jobs = Vec::new();
    let mut other_jobs = Vec::new();
    for i in 0..10u64 {
        let gpu = classes[(i % 3) as usize];
        let job_id = pipeline.enqueue("train", gpu, task_payload(i)).await;
        if gpu == "A" {
            a_jobs.push(job_id);
        } else {
            other_jobs.push(job_id);
        }
    }

    for job_id in &a_jobs {
        assert_eventually(
            || async { pipeline.job_state(job_id).await == Some(JobState::Success) },
            WAIT,
            "class-A job should reach success",
        )
        .await;
    }

    // Give the supervisor a chance to (wrongly) touch the rest.
    tokio::time::sleep(Duration::from_millis(300)).await;

    for job_id in &other_jobs {
        assert_eq!(
            pipeline.job_state(job_id).await,
            Some(JobState::Scheduled),
            "mismatched job must stay scheduled"
        );
        assert!(
            pipeline.events_for(job_id).await.is_empty(),
            "no supervisor may emit events for a mismatched job"
        );
    }
    assert_eq!(w_a.executions().len(), a_jobs.len());
}

/// Undecodable log entries are acknowledged away without producing events.
#[tokio::test]
async fn malformed_entries_are_dropped() {
    let pipeline = TestPipeline::new();
    let _w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;

    pipeline
        .shared_store()
        .append(
            JOB_STREAM,
            vec![("garbage".to_string(), "yes".to_string())],
        )
        .await
        .expect("append");

    assert_eventually(
        || async {
            let pending = pipeline
                .shared_store()
                .pending(JOB_STREAM, WORKER_GROUP, Duration::ZERO, 16)
                .await
                .expect("pending");
            pending.is_empty()
        },
        WAIT,
        "malformed entry should be acked away",
    )
    .await;
    assert!(pipeline.events().await.is_empty());
}

/// Entries referencing a job without metadata are acknowledged away.
#[tokio::test]
async fn entries_for_unknown_jobs_are_dropped() {
    let pipeline = TestPipeline::new();
    let _w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;

    pipeline
        .shared_store()
        .append(
            JOB_STREAM,
            vec![
                ("job_id".to_string(), "ghost".to_string()),
                ("payload".to_string(), "{}".to_string()),
                ("state".to_string(), "scheduled".to_string()),
            ],
        )
        .await
        .expect("append");

    assert_eventually(
        || async {
            let pending = pipeline
                .shared_store()
                .pending(JOB_STREAM, WORKER_GROUP, Duration::ZERO, 16)
                .await
                .expect("pending");
            pending.is_empty()
        },
        WAIT,
        "unknown-job entry should be acked away",
    )
    .await;
    assert!(pipeline.events().await.is_empty());
}
