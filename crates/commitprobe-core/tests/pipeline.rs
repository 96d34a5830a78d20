//! End-to-end pipeline runs over scripted collaborators.

use std::sync::Arc;

use commitprobe_core::backend::fakes::ScriptedBackend;
use commitprobe_core::sandbox::fakes::ScriptedExecutor;
use commitprobe_core::sandbox::ExecutionResult;
use commitprobe_core::{
    AssessmentSource, CancelToken, CommitInput, EngineConfig, FingerprintCache, FsCacheStore,
    Orchestrator, RequestPurpose, RetryPolicy, RunReport, RunState, TestVerdict, UnitStatus,
    UNKNOWN_TAG,
};

const PRE: &str = "def add(a, b):\n    return a + b\n";
const POST: &str = "def add(a, b):\n    return a - b\n";
const DIFF: &str = "diff --git a/calc.py b/calc.py\n--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a + b\n+    return a - b\n";

const MULTI_PRE: &str = "def a():\n    return 1\n\ndef b():\n    return 2\n\ndef c():\n    return 3\n";
const MULTI_POST: &str = "def a():\n    return 10\n\ndef b():\n    return 20\n\ndef c():\n    return 30\n";
const MULTI_DIFF: &str = "--- a/multi.py\n+++ b/multi.py\n@@ -1,8 +1,8 @@\n def a():\n-    return 1\n+    return 10\n \n def b():\n-    return 2\n+    return 20\n \n def c():\n-    return 3\n+    return 30\n";

const TEST_REPLY: &str = "```python\nimport unittest\n\nclass TestAdd(unittest.TestCase):\n    def test_add(self):\n        self.assertEqual(1, 1)\n```";

fn one_function_commit() -> CommitInput {
    CommitInput::new("c0ffee", DIFF)
        .with_pre_source("calc.py", PRE)
        .with_post_source("calc.py", POST)
}

fn three_function_commit() -> CommitInput {
    CommitInput::new("deadbeef", MULTI_DIFF)
        .with_pre_source("multi.py", MULTI_PRE)
        .with_post_source("multi.py", MULTI_POST)
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        rate_limit_backoff_ms: 1,
        attempt_timeout_ms: 5_000,
        jitter: false,
    }
}

fn scoring_backend(score: f64) -> ScriptedBackend {
    ScriptedBackend::new("scripted").with_responder(move |request| match request.purpose {
        RequestPurpose::Risk => Ok(format!(r#"{{"score": {score}, "tags": ["logic"]}}"#)),
        RequestPurpose::Synthesis => Ok(TEST_REPLY.to_string()),
    })
}

fn orchestrator(
    config: EngineConfig,
    backend: Arc<ScriptedBackend>,
    cache: Arc<FingerprintCache>,
    executor: Arc<ScriptedExecutor>,
) -> Orchestrator {
    Orchestrator::new(config, backend, cache, executor)
        .unwrap()
        .with_retry_policy(fast_policy())
}

#[tokio::test]
async fn test_risky_function_gets_test_and_outcome() {
    let backend = Arc::new(scoring_backend(0.9));
    let executor = Arc::new(ScriptedExecutor::new());
    executor.push(ExecutionResult::exited(0).with_executed_lines(vec![1, 2]));
    let config = EngineConfig::default();
    let orch = orchestrator(
        config.clone(),
        backend.clone(),
        Arc::new(FingerprintCache::new(16)),
        executor.clone(),
    );

    let run = orch.run(one_function_commit(), CancelToken::new()).await;

    assert_eq!(run.state, RunState::Done);
    assert!(!run.cancelled);
    assert_eq!(run.units.len(), 1);
    assert_eq!(run.units[0].id.symbol, "add");
    assert_eq!(run.tests.len(), 1);
    assert_eq!(run.tests[0].unit, run.units[0].id);
    assert_eq!(run.outcomes.len(), 1);
    assert_eq!(run.outcomes[0].verdict, TestVerdict::Pass);
    let aggregated = run.aggregated.as_ref().unwrap();
    assert!((aggregated.commit_score - 0.9).abs() < 1e-9);

    let report = RunReport::from_run(&run, &config);
    assert!(report.succeeded());
    assert_eq!(report.summary.tests_passed, 1);
    assert_eq!(report.units[0].status, UnitStatus::Assessed);
    // Full coverage of a passing test halves the residual risk.
    assert!((report.residual_commit_score - 0.45).abs() < 1e-9);

    let request = &executor.requests()[0];
    assert_eq!(request.target_file, "calc.py");
    assert!(request.files.iter().any(|f| f.path == "calc.py" && f.contents == POST));
}

#[tokio::test]
async fn test_low_risk_commit_skips_synthesis() {
    let backend = Arc::new(scoring_backend(0.2));
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(
        EngineConfig::default(),
        backend.clone(),
        Arc::new(FingerprintCache::new(16)),
        executor.clone(),
    );

    let run = orch.run(one_function_commit(), CancelToken::new()).await;

    assert_eq!(run.state, RunState::Done);
    assert!(run.tests.is_empty());
    assert!(run.outcomes.is_empty());
    assert_eq!(backend.calls(RequestPurpose::Synthesis), 0);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn test_malformed_replies_degrade_without_failing_run() {
    let backend = Arc::new(
        ScriptedBackend::new("scripted").with_responder(|_| Ok("{\"score\": oops".to_string())),
    );
    let config = EngineConfig {
        risk_threshold: 0.9,
        ..EngineConfig::default()
    };
    let orch = orchestrator(
        config.clone(),
        backend.clone(),
        Arc::new(FingerprintCache::new(16)),
        Arc::new(ScriptedExecutor::new()),
    );

    let run = orch.run(one_function_commit(), CancelToken::new()).await;

    assert_eq!(run.state, RunState::Done);
    assert!(run.failure.is_none());
    let assessment = &run.assessments[0];
    assert_eq!(assessment.source, AssessmentSource::Degraded);
    assert!(assessment.tags.contains(UNKNOWN_TAG));
    assert_eq!(assessment.score, config.default_risk_score);
    assert_eq!(
        backend.calls(RequestPurpose::Risk),
        fast_policy().max_attempts() as usize
    );

    let report = RunReport::from_run(&run, &config);
    assert_eq!(report.units[0].status, UnitStatus::Degraded);
    assert_eq!(report.summary.degraded, 1);
}

#[tokio::test]
async fn test_cancel_mid_running_keeps_completed_outcomes() {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    // The first execution cancels the run; later jobs must never start.
    let executor = Arc::new(ScriptedExecutor::new().with_responder(move |_| {
        trigger.cancel();
        ExecutionResult::exited(0)
    }));
    let config = EngineConfig {
        concurrency_limit: 1,
        ..EngineConfig::default()
    };
    let orch = orchestrator(
        config.clone(),
        Arc::new(scoring_backend(0.8)),
        Arc::new(FingerprintCache::new(16)),
        executor.clone(),
    );

    let run = orch.run(three_function_commit(), cancel).await;

    assert_eq!(run.state, RunState::Done);
    assert!(run.cancelled);
    assert_eq!(run.units.len(), 3);
    assert_eq!(run.tests.len(), 3);
    assert_eq!(executor.calls(), 1);
    assert_eq!(run.outcomes.len(), 1);
    assert_eq!(run.outcomes[0].verdict, TestVerdict::Pass);

    let report = RunReport::from_run(&run, &config);
    assert!(report.cancelled);
    assert_eq!(report.summary.tests_passed, 1);
    assert_eq!(
        report.units.iter().filter(|u| u.verdict.is_some()).count(),
        1
    );
}

#[tokio::test]
async fn test_cancel_before_start_issues_no_work() {
    let backend = Arc::new(scoring_backend(0.9));
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(
        EngineConfig::default(),
        backend.clone(),
        Arc::new(FingerprintCache::new(16)),
        executor.clone(),
    );
    let cancel = CancelToken::new();
    cancel.cancel();

    let run = orch.run(one_function_commit(), cancel).await;

    assert_eq!(run.state, RunState::Done);
    assert!(run.cancelled);
    assert_eq!(run.units.len(), 1);
    assert!(run.assessments.is_empty());
    assert!(backend.requests().is_empty());
    assert_eq!(executor.calls(), 0);
    assert_eq!(
        run.state_history,
        vec![
            RunState::Extracting,
            RunState::Scoring,
            RunState::Aggregating,
            RunState::Synthesizing,
            RunState::Running,
            RunState::Reporting,
            RunState::Done,
        ]
    );
}

#[tokio::test]
async fn test_declined_synthesis_is_recorded_on_unit() {
    let backend = Arc::new(ScriptedBackend::new("scripted").with_responder(|request| {
        match request.purpose {
            RequestPurpose::Risk => Ok(r#"{"score": 0.95}"#.to_string()),
            RequestPurpose::Synthesis => Ok(r#"{"declined": "nothing to test"}"#.to_string()),
        }
    }));
    let config = EngineConfig::default();
    let orch = orchestrator(
        config.clone(),
        backend.clone(),
        Arc::new(FingerprintCache::new(16)),
        Arc::new(ScriptedExecutor::new()),
    );

    let run = orch.run(one_function_commit(), CancelToken::new()).await;

    assert_eq!(run.state, RunState::Done);
    assert!(run.tests.is_empty());
    assert_eq!(run.synthesis_failures.len(), 1);
    assert_eq!(run.synthesis_failures[0].kind, "synthesis_rejected");
    assert_eq!(backend.calls(RequestPurpose::Synthesis), 1);

    let report = RunReport::from_run(&run, &config);
    assert_eq!(report.summary.synthesis_failures, 1);
    assert!(report.units[0].synthesis_failure.is_some());
}

#[tokio::test]
async fn test_persistent_cache_serves_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::default();

    let first_backend = Arc::new(scoring_backend(0.9));
    let store = Arc::new(FsCacheStore::new(dir.path()).unwrap());
    let first = orchestrator(
        config.clone(),
        first_backend.clone(),
        Arc::new(FingerprintCache::with_store(16, store)),
        Arc::new(ScriptedExecutor::new()),
    );
    let run = first.run(one_function_commit(), CancelToken::new()).await;
    assert_eq!(run.state, RunState::Done);
    assert_eq!(first_backend.calls(RequestPurpose::Risk), 1);
    assert_eq!(first_backend.calls(RequestPurpose::Synthesis), 1);

    // Fresh in-memory layer over the same directory.
    let second_backend = Arc::new(ScriptedBackend::new("scripted"));
    let store = Arc::new(FsCacheStore::new(dir.path()).unwrap());
    let second = orchestrator(
        config,
        second_backend.clone(),
        Arc::new(FingerprintCache::with_store(16, store)),
        Arc::new(ScriptedExecutor::new()),
    );
    let rerun = second.run(one_function_commit(), CancelToken::new()).await;

    assert_eq!(rerun.state, RunState::Done);
    assert!(second_backend.requests().is_empty());
    assert_eq!(rerun.assessments[0].source, AssessmentSource::Cache);
    assert!(rerun.tests[0].from_cache);
    assert_eq!(rerun.assessments[0].score, run.assessments[0].score);
}

#[tokio::test]
async fn test_unit_order_matches_extraction_under_concurrency() {
    let backend = Arc::new(
        ScriptedBackend::new("scripted")
            .with_latency(std::time::Duration::from_millis(5))
            .with_responder(|request| match request.purpose {
                RequestPurpose::Risk => Ok(r#"{"score": 0.3}"#.to_string()),
                RequestPurpose::Synthesis => Ok(TEST_REPLY.to_string()),
            }),
    );
    let orch = orchestrator(
        EngineConfig {
            concurrency_limit: 3,
            ..EngineConfig::default()
        },
        backend,
        Arc::new(FingerprintCache::new(16)),
        Arc::new(ScriptedExecutor::new()),
    );

    let run = orch.run(three_function_commit(), CancelToken::new()).await;

    let unit_ids: Vec<_> = run.units.iter().map(|u| u.id.clone()).collect();
    let assessed: Vec<_> = run.assessments.iter().map(|a| a.unit.clone()).collect();
    assert_eq!(unit_ids, assessed);
    let symbols: Vec<&str> = run.units.iter().map(|u| u.id.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_sandbox_receives_unchanged_tree_files() {
    let executor = Arc::new(ScriptedExecutor::new());
    let orch = orchestrator(
        EngineConfig::default(),
        Arc::new(scoring_backend(0.9)),
        Arc::new(FingerprintCache::new(16)),
        executor.clone(),
    );
    let input = one_function_commit()
        .with_context_source("helpers.py", "def twice(x):\n    return 2 * x\n")
        .with_context_source("calc.py", "stale copy\n");

    let run = orch.run(input, CancelToken::new()).await;

    assert_eq!(run.state, RunState::Done);
    assert_eq!(run.units.len(), 1);
    let request = &executor.requests()[0];
    assert!(request.files.iter().any(|f| f.path == "helpers.py"));
    let calc: Vec<_> = request.files.iter().filter(|f| f.path == "calc.py").collect();
    assert_eq!(calc.len(), 1);
    assert_eq!(calc[0].contents, POST);
}

#[tokio::test]
async fn test_baseline_run_covers_every_file() {
    let backend = Arc::new(scoring_backend(0.9));
    let orch = orchestrator(
        EngineConfig::default(),
        backend.clone(),
        Arc::new(FingerprintCache::new(16)),
        Arc::new(ScriptedExecutor::new()),
    );
    let input = CommitInput::baseline("tree", [("calc.py", POST), ("multi.py", MULTI_POST)]);

    let run = orch.run(input, CancelToken::new()).await;

    assert_eq!(run.state, RunState::Done);
    let symbols: Vec<&str> = run.units.iter().map(|u| u.id.symbol.as_str()).collect();
    for symbol in ["add", "a", "b", "c"] {
        assert!(symbols.contains(&symbol), "missing {symbol}: {symbols:?}");
    }
    assert!(run.tests.len() >= 4);
    assert_eq!(run.outcomes.len(), run.tests.len());
}
