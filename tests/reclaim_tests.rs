//! Pending-entry reclaim: crash recovery and affinity-aware claim rules.


use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;

use gpuflow::scheduler::JobState;
use gpuflow::store::{Store, JOB_STREAM, WORKER_GROUP};
use test_harness::{assert_eventually, RecordingExecutor, TestPipeline, WAIT};

/// Idle time safely past the harness pending timeout of 200 ms.
const PAST_TIMEOUT: Duration = Duration::from_millis(300);

/// A supervisor killed mid-execution leaves its claim dangling; a second
/// instance reclaims the entry after the pending timeout and completes the
/// job. The job runs at least once and at most twice.
#[tokio::test]
async fn killed_supervisor_claim_is_recovered() {
    let pipeline = TestPipeline::new();
    let w1 = pipeline.spawn_supervisor("w_amd_1", "AMD").await;

    let job_id = pipeline.enqueue("hang", "AMD", Map::new()).await;

    assert_eventually(
        || async { pipeline.job_state(&job_id).await == Some(JobState::InProgress) },
        WAIT,
        "first supervisor should claim and start the job",
    )
    .await;
    w1.kill();

    let w2 = pipeline
        .spawn_supervisor_with(
            "w_amd_2",
            "AMD",
            Arc::new(RecordingExecutor::always_succeeding()),
        )
        .await;
    tokio::time::sleep(PAST_TIMEOUT).await;

    let reclaimed = pipeline
        .reclaim_loop(&w2)
        .scan_once()
        .await
        .expect("reclaim scan");
    assert_eq!(reclaimed, 1);

    assert_eventually(
        || async { pipeline.job_state(&job_id).await == Some(JobState::Success) },
        WAIT,
        "reclaimed job should reach success",
    )
    .await;

    let executions = w1.executions().len() + w2.executions().len();
    assert!(
        (1..=2).contains(&executions),
        "job executed {executions} times, expected 1 or 2"
    );
    let successes = pipeline
        .events_for(&job_id)
        .await
        .iter()
        .filter(|e| e.state == JobState::Success)
        .count();
    assert_eq!(successes, 1);
}

/// An entry skipped by a mismatched supervisor stays pending under that
/// consumer until a matching supervisor reclaims it.
#[tokio::test]
async fn mismatched_pending_entry_moves_to_matching_supervisor() {
    let pipeline = TestPipeline::new();
    let w_nv = pipeline.spawn_supervisor("w_nv", "NVIDIA").await;

    let job_id = pipeline.enqueue("train", "AMD", Map::new()).await;

    // The NVIDIA supervisor reads the entry, skips it, and leaves it
    // pending under its own name.
    assert_eventually(
        || async {
            let pending = pipeline
                .shared_store()
                .pending(JOB_STREAM, WORKER_GROUP, Duration::ZERO, 16)
                .await
                .expect("pending");
            pending.iter().any(|p| p.consumer == "w_nv")
        },
        WAIT,
        "mismatched entry should sit pending under w_nv",
    )
    .await;
    assert_eq!(pipeline.job_state(&job_id).await, Some(JobState::Scheduled));

    // The NVIDIA supervisor's own reclaim never touches it.
    let nv_scan = pipeline
        .reclaim_loop(&w_nv)
        .scan_once()
        .await
        .expect("nv scan");
    assert_eq!(nv_scan, 0);

    let w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;
    tokio::time::sleep(PAST_TIMEOUT).await;

    let reclaimed = pipeline
        .reclaim_loop(&w_amd)
        .scan_once()
        .await
        .expect("amd scan");
    assert_eq!(reclaimed, 1);

    assert_eventually(
        || async { pipeline.job_state(&job_id).await == Some(JobState::Success) },
        WAIT,
        "reclaimed AMD job should reach success",
    )
    .await;
    assert_eq!(w_amd.executions(), vec![job_id]);
    assert!(w_nv.executions().is_empty());
}

/// Entries younger than the pending timeout are left alone.
#[tokio::test]
async fn fresh_pending_entries_are_not_reclaimed() {
    let pipeline = TestPipeline::new();
    let _w_nv = pipeline.spawn_supervisor("w_nv", "NVIDIA").await;

    let _job_id = pipeline.enqueue("train", "AMD", Map::new()).await;
    assert_eventually(
        || async {
            !pipeline
                .shared_store()
                .pending(JOB_STREAM, WORKER_GROUP, Duration::ZERO, 16)
                .await
                .expect("pending")
                .is_empty()
        },
        WAIT,
        "entry should be pending",
    )
    .await;

    let w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;
    // With a generous pending timeout the entry is never idle enough.
    let config = test_harness::test_config("w_amd", "AMD")
        .with_pending_timeout(Duration::from_secs(60));
    let reclaim = gpuflow::supervisor::ReclaimLoop::new(
        pipeline.shared_store(),
        w_amd.supervisor.clone(),
        &config,
    );
    let reclaimed = reclaim.scan_once().await.expect("scan");
    assert_eq!(reclaimed, 0);
}

/// The periodic reclaim loop recovers mismatched entries end to end, the
/// way the app wires it.
#[tokio::test]
async fn reclaim_loop_recovers_entries_in_background() {
    let pipeline = TestPipeline::new();
    let _w_nv = pipeline.spawn_supervisor("w_nv", "NVIDIA").await;
    let w_amd = pipeline.spawn_supervisor("w_amd", "AMD").await;
    let _reclaim = pipeline.spawn_reclaim(&w_amd);

    let job_id = pipeline.enqueue("train", "AMD", Map::new()).await;

    assert_eventually(
        || async { pipeline.job_state(&job_id).await == Some(JobState::Success) },
        WAIT,
        "AMD job should complete regardless of who read it first",
    )
    .await;
}
