mod common;

use std::sync::{atomic::AtomicBool, Arc};

use common::MockOracle;
use serde_json::json;
use unminify::{
    ApproveAll, BatchState, Deminifier, DeminifyError, DeminifyOptions, NoProgress, RenameCache,
};

fn batch_options(workdir: &std::path::Path) -> DeminifyOptions {
    DeminifyOptions {
        skip_confirmation: true,
        use_batch: true,
        file_name: "bundle.min.js".to_owned(),
        working_dir: Some(workdir.to_path_buf()),
        ..DeminifyOptions::default()
    }
}

const SOURCE: &str = "function a(x,y){return x+y;}";

fn scripted_oracle() -> MockOracle {
    MockOracle::new().with_mapping(
        "a",
        json!({"functionName": "add", "renames": {"x": "num1", "y": "num2"}}),
    )
}

#[tokio::test]
async fn deferred_run_submits_polls_and_fetches() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let workdir = tempfile::tempdir().expect("tempdir");
    let oracle = scripted_oracle();
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        batch_options(workdir.path()),
    );
    let output = deminifier
        .deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("deferred run completes");
    assert_eq!(output.source, "function add(num1,num2){return num1+num2;}");
    assert_eq!(oracle.submit_calls(), 1);
    assert_eq!(oracle.complete_calls(), 0, "deferred mode never uses interactive requests");

    let cache = RenameCache::new(cache_dir.path());
    let project_id = RenameCache::project_id(workdir.path());
    assert!(
        cache.load_batch_state(&project_id).is_none(),
        "batch state is cleared after retrieval"
    );
}

#[tokio::test]
async fn cancelled_submission_resumes_without_resubmitting() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let workdir = tempfile::tempdir().expect("tempdir");
    let oracle = scripted_oracle();

    // First run: cancelled right after submission. The job keeps running
    // server-side and the state file survives.
    let cancelled = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        DeminifyOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..batch_options(workdir.path())
        },
    );
    let first = cancelled
        .deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("cancellation is not an error");
    assert!(first.cancelled);
    assert_eq!(first.source, SOURCE);
    assert_eq!(oracle.submit_calls(), 1);

    let cache = RenameCache::new(cache_dir.path());
    let project_id = RenameCache::project_id(workdir.path());
    let state = cache
        .load_batch_state(&project_id)
        .expect("state survives a cancelled run");
    assert_eq!(state.batch_id, "mock-batch-0001");
    assert_eq!(state.function_count, 1);

    // Second run: picks up the saved batch ID and completes.
    let resumed = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        batch_options(workdir.path()),
    );
    let second = resumed
        .deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("resumed run completes");
    assert_eq!(oracle.submit_calls(), 1, "resume must not resubmit");
    assert_eq!(second.source, "function add(num1,num2){return num1+num2;}");
    assert!(
        cache.load_batch_state(&project_id).is_none(),
        "state cleared once results are in"
    );
}

#[tokio::test]
async fn explicit_resume_id_overrides_state_lookup() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let workdir = tempfile::tempdir().expect("tempdir");
    let oracle = scripted_oracle();

    // Seed the provider with a submitted job, then drop the local state as
    // if the cache had been wiped.
    let seeded = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        DeminifyOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..batch_options(workdir.path())
        },
    );
    seeded
        .deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("seeding run completes");
    let cache = RenameCache::new(cache_dir.path());
    let project_id = RenameCache::project_id(workdir.path());
    cache.clear_batch_state(&project_id);

    let resumed = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        DeminifyOptions {
            resume_batch_id: Some("mock-batch-0001".to_owned()),
            ..batch_options(workdir.path())
        },
    );
    let output = resumed
        .deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("explicit resume completes");
    assert_eq!(oracle.submit_calls(), 1);
    assert!(output.source.contains("function add"));
}

#[tokio::test]
async fn mismatched_pending_batch_is_a_collision() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let workdir = tempfile::tempdir().expect("tempdir");
    let cache = RenameCache::new(cache_dir.path());
    let project_id = RenameCache::project_id(workdir.path());
    cache.save_batch_state(&BatchState {
        batch_id: "stale-batch".to_owned(),
        source_hash: "0000000000000000".to_owned(),
        output_path: String::new(),
        created_at: chrono::Utc::now(),
        model: "mock-model".to_owned(),
        function_count: 7,
        file_name: "other.js".to_owned(),
        project_id: project_id.clone(),
    });

    let oracle = scripted_oracle();
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        batch_options(workdir.path()),
    );
    let result = deminifier.deminify(SOURCE, &ApproveAll, &mut NoProgress).await;
    match result {
        Err(DeminifyError::BatchCollision { existing, .. }) => {
            assert_eq!(existing, "stale-batch");
        }
        other => panic!("expected BatchCollision, got {other:?}"),
    }
    assert_eq!(oracle.submit_calls(), 0, "a collision must not submit anything");
}

#[tokio::test]
async fn projects_in_different_directories_do_not_collide() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let workdir_a = tempfile::tempdir().expect("tempdir");
    let workdir_b = tempfile::tempdir().expect("tempdir");
    let oracle = scripted_oracle();

    // Project A leaves a pending batch behind.
    let a = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        DeminifyOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..batch_options(workdir_a.path())
        },
    );
    a.deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("project A submits");

    // Project B shares the cache directory but must not see A's state.
    // A different source guarantees a different hash, which would collide
    // if the namespace were shared.
    let b = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        batch_options(workdir_b.path()),
    );
    let output = b
        .deminify("function z(q){return q*q;}", &ApproveAll, &mut NoProgress)
        .await
        .expect("project B runs independently");
    assert!(!output.cancelled);
    assert_eq!(oracle.submit_calls(), 2, "B submits its own job");

    let cache = RenameCache::new(cache_dir.path());
    let state_a = cache.load_batch_state(&RenameCache::project_id(workdir_a.path()));
    assert!(state_a.is_some(), "A's pending state survives B's completed run");
    let state_b = cache.load_batch_state(&RenameCache::project_id(workdir_b.path()));
    assert!(state_b.is_none(), "B's state is cleared after completion");
}

#[tokio::test]
async fn fully_cached_deferred_runs_skip_submission() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let workdir = tempfile::tempdir().expect("tempdir");
    let oracle = scripted_oracle();

    let first = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        batch_options(workdir.path()),
    );
    first
        .deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("first run completes");
    assert_eq!(oracle.submit_calls(), 1);

    let second = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        batch_options(workdir.path()),
    );
    let output = second
        .deminify(SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("second run completes");
    assert_eq!(oracle.submit_calls(), 1, "a fully cached run submits nothing");
    assert_eq!(output.source, "function add(num1,num2){return num1+num2;}");
}
