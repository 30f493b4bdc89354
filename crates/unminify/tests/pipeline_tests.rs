mod common;

use std::sync::{atomic::AtomicBool, Arc};

use common::MockOracle;
use serde_json::json;
use unminify::{
    ApproveAll, CollectProgress, CostEstimate, CostGate, Deminifier, DeminifyError,
    DeminifyOptions, NoProgress, RenameCache,
};

fn options() -> DeminifyOptions {
    DeminifyOptions {
        skip_confirmation: true,
        ..DeminifyOptions::default()
    }
}

struct DenyGate;

impl CostGate for DenyGate {
    fn confirm(&self, _estimate: &CostEstimate) -> bool {
        false
    }
}

#[tokio::test]
async fn trivial_leaf_end_to_end() {
    let oracle = MockOracle::new().with_mapping(
        "a",
        json!({"functionName": "add", "renames": {"x": "num1", "y": "num2"}}),
    );
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        options(),
    );
    let output = deminifier
        .deminify("function a(x,y){return x+y;}", &ApproveAll, &mut NoProgress)
        .await
        .expect("pipeline completes");
    assert_eq!(output.source, "function add(num1,num2){return num1+num2;}");
    assert_eq!(oracle.complete_calls(), 1);
    assert_eq!(output.stats.renames_applied, 3);
}

const DEPENDENCY_SOURCE: &str = "function add(a,b){return a+b;}\
function mul(a,b){return a*b;}\
function calc(x){return add(x,1)+mul(x,2);}\
function main(){return calc(5);}";

#[tokio::test]
async fn processing_order_is_bottom_up() {
    let oracle = MockOracle::new();
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        options(),
    );
    deminifier
        .deminify(DEPENDENCY_SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("pipeline completes");

    let requests = oracle.requests();
    let index_of = |name: &str| {
        requests
            .iter()
            .position(|r| r.user_prompt.contains(&format!("### {name}_")))
            .unwrap_or_else(|| panic!("{name} was never requested"))
    };
    assert!(index_of("add") < index_of("calc"), "leaves before their callers");
    assert!(index_of("mul") < index_of("calc"), "leaves before their callers");
    assert!(index_of("calc") < index_of("main"), "callers last");
}

#[tokio::test]
async fn known_names_reach_later_rounds_as_advisory_comments() {
    let oracle = MockOracle::new()
        .with_mapping("calc", json!({"functionName": "computeTotal", "renames": {}}));
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        options(),
    );
    let output = deminifier
        .deminify(DEPENDENCY_SOURCE, &ApproveAll, &mut NoProgress)
        .await
        .expect("pipeline completes");

    let requests = oracle.requests();
    let main_request = requests
        .iter()
        .find(|r| r.user_prompt.contains("### main_"))
        .expect("main was requested");
    assert!(
        main_request.user_prompt.contains("// Calls: calc -> computeTotal"),
        "advisory comment lists the renamed callee:\n{}",
        main_request.user_prompt
    );
    // The advisory channel never edits the source; only the final rename does.
    assert!(output.source.contains("computeTotal(5)"));
    assert!(!output.source.contains("// Calls:"));
}

#[tokio::test]
async fn mutual_recursion_is_admitted_in_one_round() {
    let oracle = MockOracle::new()
        .with_mapping("f", json!({"functionName": "ping", "renames": {}}))
        .with_mapping("g", json!({"functionName": "pong", "renames": {}}));
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        options(),
    );
    let output = deminifier
        .deminify(
            "function f(n){return n<=0?0:g(n-1);}function g(n){return f(n-1);}",
            &ApproveAll,
            &mut NoProgress,
        )
        .await
        .expect("pipeline completes");
    assert_eq!(
        oracle.complete_calls(),
        1,
        "the cycle fallback admits both functions in a single batch"
    );
    assert!(output.source.contains("function ping"));
    assert!(output.source.contains("function pong"));
    assert!(output.source.contains("ping(n-1)"));
}

#[tokio::test]
async fn second_run_is_served_entirely_from_cache() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let oracle = MockOracle::new().with_mapping(
        "a",
        json!({"functionName": "add", "renames": {"x": "num1", "y": "num2"}}),
    );
    let source = "function a(x,y){return x+y;}";

    let first = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        options(),
    );
    let first_output = first
        .deminify(source, &ApproveAll, &mut NoProgress)
        .await
        .expect("first run completes");
    assert_eq!(oracle.complete_calls(), 1);

    let second = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        options(),
    );
    let second_output = second
        .deminify(source, &ApproveAll, &mut NoProgress)
        .await
        .expect("second run completes");
    assert_eq!(oracle.complete_calls(), 1, "second run makes zero oracle calls");
    assert_eq!(first_output.source, second_output.source, "byte-identical output");
    assert_eq!(second_output.stats.counters.cache_hits, 1);
}

#[tokio::test]
async fn whitespace_only_edits_keep_cache_entries_valid() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let oracle = MockOracle::new().with_mapping(
        "a",
        json!({"renames": {"x": "value"}}),
    );

    let first = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        options(),
    );
    first
        .deminify("function a(x){return x;}", &ApproveAll, &mut NoProgress)
        .await
        .expect("first run completes");
    assert_eq!(oracle.complete_calls(), 1);

    let second = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        options(),
    );
    second
        .deminify(
            "function a(x)\n{\n    return x;\n}",
            &ApproveAll,
            &mut NoProgress,
        )
        .await
        .expect("second run completes");
    assert_eq!(
        oracle.complete_calls(),
        1,
        "reindenting a function must still hit its cache entry"
    );
}

#[tokio::test]
async fn batch_failure_is_absorbed_and_counted() {
    let oracle = MockOracle::new();
    oracle.fail_next(1);
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        options(),
    );
    let source = "function a(x){return x;}";
    let output = deminifier
        .deminify(source, &ApproveAll, &mut NoProgress)
        .await
        .expect("run continues past a failed batch");
    assert_eq!(output.source, source, "failed batch leaves its functions unrenamed");
    assert_eq!(output.stats.counters.errors, 1);
    assert!(!output.cancelled);
}

#[tokio::test]
async fn cost_gate_rejection_aborts_cleanly() {
    let oracle = MockOracle::new();
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        DeminifyOptions::default(),
    );
    let result = deminifier
        .deminify("function a(x){return x;}", &DenyGate, &mut NoProgress)
        .await;
    assert!(matches!(result, Err(DeminifyError::CostCancelled)));
    assert_eq!(oracle.complete_calls(), 0, "no oracle traffic after rejection");
}

#[tokio::test]
async fn fully_cached_runs_never_consult_the_gate() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let oracle = MockOracle::new().with_mapping("a", json!({"renames": {"x": "value"}}));
    let source = "function a(x){return x;}";

    let warm = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        options(),
    );
    warm.deminify(source, &ApproveAll, &mut NoProgress)
        .await
        .expect("warm-up run completes");

    // Same cache, denying gate, confirmation NOT skipped: must still pass
    // because there is nothing left to spend.
    let cached = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::new(cache_dir.path()),
        DeminifyOptions::default(),
    );
    let output = cached
        .deminify(source, &DenyGate, &mut NoProgress)
        .await
        .expect("cached run needs no confirmation");
    assert!(output.source.contains("value"));
}

#[tokio::test]
async fn cancellation_returns_the_original_source() {
    let oracle = MockOracle::new();
    let cancel = Arc::new(AtomicBool::new(true));
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        DeminifyOptions {
            cancel: Some(Arc::clone(&cancel)),
            ..options()
        },
    );
    let source = "function a(x){return x;}";
    let output = deminifier
        .deminify(source, &ApproveAll, &mut NoProgress)
        .await
        .expect("cancellation is not an error");
    assert!(output.cancelled);
    assert_eq!(output.source, source);
    assert_eq!(oracle.complete_calls(), 0);
}

#[tokio::test]
async fn tiny_budgets_force_singleton_batches() {
    let oracle = MockOracle::new();
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        DeminifyOptions {
            max_batch_tokens: Some(1),
            ..options()
        },
    );
    deminifier
        .deminify(
            "function add(a,b){return a+b;}function mul(a,b){return a*b;}",
            &ApproveAll,
            &mut NoProgress,
        )
        .await
        .expect("pipeline completes");
    assert_eq!(oracle.complete_calls(), 2, "one request per over-budget function");
    for request in oracle.requests() {
        assert_eq!(
            request.user_prompt.matches("### ").count(),
            1,
            "singleton batches carry exactly one function"
        );
    }
}

#[tokio::test]
async fn progress_reports_cumulative_counts() {
    let oracle = MockOracle::new();
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        options(),
    );
    let mut progress = CollectProgress::new();
    deminifier
        .deminify(DEPENDENCY_SOURCE, &ApproveAll, &mut progress)
        .await
        .expect("pipeline completes");
    let updates = progress.updates();
    assert!(!updates.is_empty(), "at least one update per batch");
    let last = updates.last().expect("nonempty");
    assert_eq!(last.current, 4);
    assert_eq!(last.total, 4);
    assert!(last.input_tokens > 0, "token counters accumulate");
    assert!(
        updates.windows(2).all(|w| w[0].current <= w[1].current),
        "progress never goes backwards"
    );
}

#[tokio::test]
async fn sources_without_functions_pass_through() {
    let oracle = MockOracle::new();
    let deminifier = Deminifier::new(
        Box::new(oracle.clone()),
        RenameCache::disabled(),
        options(),
    );
    let source = "const answer = 42; console.log(answer);";
    let output = deminifier
        .deminify(source, &ApproveAll, &mut NoProgress)
        .await
        .expect("run completes");
    assert_eq!(output.source, source);
    assert_eq!(oracle.complete_calls(), 0);
}
