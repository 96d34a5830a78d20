//! Pipeline orchestration.
//!
//! Walks a run through `Extracting → Scoring → Aggregating → Synthesizing →
//! Running → Reporting → Done` with a strict barrier between states. Work
//! inside Scoring, Synthesizing and Running fans out over tokio tasks bounded
//! by a semaphore; results are collected by unit index so output order always
//! matches extraction order.
//!
//! Unit-level failures are recorded on the unit. Run-level failures (no units
//! from a non-empty commit, a cache conflict) move the run to `Failed`.
//! Cancellation keeps partial results, stops issuing backend calls and
//! sandbox executions, and walks the remaining states to `Done`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{warn, Instrument};

use crate::aggregate::aggregate;
use crate::backend::ModelBackend;
use crate::cache::FingerprintCache;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::domain::error::{ProbeError, Result};
use crate::domain::run::{PipelineRun, RunState, SynthesisFailure};
use crate::domain::unit::CommitUnit;
use crate::extract::{extract, CommitInput};
use crate::inference::{InferenceError, RiskInferenceClient};
use crate::metrics::METRICS;
use crate::obs::{self, RunSpan};
use crate::retry::RetryPolicy;
use crate::sandbox::{SandboxExecutor, TestJob, TestRunner};
use crate::synthesis::{SynthesisError, TestSynthesizer};

pub struct Orchestrator {
    config: EngineConfig,
    backend: Arc<dyn ModelBackend>,
    cache: Arc<FingerprintCache>,
    inference: Arc<RiskInferenceClient>,
    synthesizer: Arc<TestSynthesizer>,
    runner: Arc<TestRunner>,
}

impl Orchestrator {
    /// Build an orchestrator over injected collaborators.
    ///
    /// Fails with [`ProbeError::InvalidConfig`] when `config` does not validate.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn ModelBackend>,
        cache: Arc<FingerprintCache>,
        executor: Arc<dyn SandboxExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let inference = Arc::new(RiskInferenceClient::new(
            Arc::clone(&backend),
            Arc::clone(&cache),
            &config,
        ));
        let synthesizer = Arc::new(TestSynthesizer::new(
            Arc::clone(&backend),
            Arc::clone(&cache),
            &config,
        ));
        let runner = Arc::new(TestRunner::new(executor, config.test_timeout()));
        Ok(Self {
            config,
            backend,
            cache,
            inference,
            synthesizer,
            runner,
        })
    }

    /// Replace the retry policy used for model calls.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.inference = Arc::new(
            RiskInferenceClient::new(Arc::clone(&self.backend), Arc::clone(&self.cache), &self.config)
                .with_policy(policy.clone()),
        );
        self.synthesizer = Arc::new(
            TestSynthesizer::new(Arc::clone(&self.backend), Arc::clone(&self.cache), &self.config)
                .with_policy(policy),
        );
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    /// Run the whole pipeline over one commit. Always returns the run; check
    /// its terminal state for failure.
    pub async fn run(&self, input: CommitInput, cancel: CancelToken) -> PipelineRun {
        let mut run = PipelineRun::new(&input.commit_id, &self.config.prompt_version);
        let span = RunSpan::span(&run.run_id.to_string(), &run.commit);
        self.drive(&mut run, &input, &cancel).instrument(span).await;
        run
    }

    async fn drive(&self, run: &mut PipelineRun, input: &CommitInput, cancel: &CancelToken) {
        let started = Instant::now();
        let run_id = run.run_id.to_string();
        obs::emit_run_started(&run_id, &run.commit, &run.prompt_version);

        // Extracting
        let extraction = match extract(input, self.config.move_detection) {
            Ok(extraction) => extraction,
            Err(err) => return fail(run, ProbeError::Extraction(err)),
        };
        if extraction.units.is_empty() && !extraction.is_empty_commit() {
            let commit = run.commit.clone();
            return fail(run, ProbeError::NoUnitsExtracted { commit });
        }
        run.units = extraction.units;
        let units = Arc::new(run.units.clone());
        note_cancel(run, cancel);

        // Scoring
        advance(run, RunState::Scoring);
        if !run.cancelled {
            if let Err(err) = self.score(run, &units, cancel).await {
                return fail(run, err);
            }
        }
        note_cancel(run, cancel);

        // Aggregating is pure and runs even after cancellation.
        advance(run, RunState::Aggregating);
        run.aggregated = Some(aggregate(&run.units, &run.assessments, &self.config));
        note_cancel(run, cancel);

        // Synthesizing
        advance(run, RunState::Synthesizing);
        if !run.cancelled {
            if let Err(err) = self.synthesize(run, &units, cancel).await {
                return fail(run, err);
            }
        }
        note_cancel(run, cancel);

        // Running
        advance(run, RunState::Running);
        if !run.cancelled {
            self.execute(run, input, cancel).await;
        }
        note_cancel(run, cancel);

        // Reporting
        advance(run, RunState::Reporting);
        METRICS.flush();
        advance(run, RunState::Done);
        obs::emit_run_finished(
            &run_id,
            run.state,
            elapsed_ms(started),
            run.units.len(),
            run.aggregated.as_ref().map(|a| a.commit_score),
        );
    }

    async fn score(
        &self,
        run: &mut PipelineRun,
        units: &Arc<Vec<CommitUnit>>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let inference = Arc::clone(&self.inference);
        let shared = Arc::clone(units);
        let token = cancel.clone();
        let results = fan_out(
            (0..units.len()).collect(),
            self.config.concurrency_limit,
            move |index: usize| {
                let inference = Arc::clone(&inference);
                let units = Arc::clone(&shared);
                let cancel = token.clone();
                async move { inference.assess_or_degrade(&units[index], &cancel).await }
            },
        )
        .await;

        let mut conflict = None;
        for result in results.into_iter().flatten() {
            match result {
                Ok(assessment) => run.assessments.push(assessment),
                Err(InferenceError::Cancelled) => {}
                Err(InferenceError::CacheConflict(err)) => {
                    conflict.get_or_insert(err);
                }
                Err(err) => warn!(error = %err, "unexpected inference failure"),
            }
        }
        match conflict {
            Some(err) => Err(ProbeError::CacheConflict(err)),
            None => Ok(()),
        }
    }

    async fn synthesize(
        &self,
        run: &mut PipelineRun,
        units: &Arc<Vec<CommitUnit>>,
        cancel: &CancelToken,
    ) -> Result<()> {
        // Assessments are already in unit order.
        let eligible: Vec<(usize, usize)> = run
            .assessments
            .iter()
            .enumerate()
            .filter(|(_, a)| self.synthesizer.qualifies(a))
            .filter_map(|(ai, a)| {
                units
                    .iter()
                    .position(|u| u.id == a.unit)
                    .filter(|&ui| !units[ui].is_removed())
                    .map(|ui| (ui, ai))
            })
            .collect();
        if eligible.is_empty() {
            return Ok(());
        }

        let synthesizer = Arc::clone(&self.synthesizer);
        let shared = Arc::clone(units);
        let assessments = Arc::new(run.assessments.clone());
        let token = cancel.clone();
        let results = fan_out(eligible.clone(), self.config.concurrency_limit, move |(ui, ai)| {
            let synthesizer = Arc::clone(&synthesizer);
            let units = Arc::clone(&shared);
            let assessments = Arc::clone(&assessments);
            let cancel = token.clone();
            async move {
                synthesizer
                    .synthesize(&units[ui], &assessments[ai], &cancel)
                    .await
            }
        })
        .await;

        let mut conflict = None;
        for ((ui, _), result) in eligible.into_iter().zip(results) {
            let Some(result) = result else { continue };
            match result {
                Ok(test) => run.tests.push(test),
                Err(SynthesisError::Cancelled) => {}
                Err(SynthesisError::CacheConflict(err)) => {
                    conflict.get_or_insert(err);
                }
                Err(err) => {
                    warn!(unit = %units[ui].id, kind = err.kind(), error = %err, "synthesis failed");
                    run.synthesis_failures.push(SynthesisFailure {
                        unit: units[ui].id.clone(),
                        kind: err.kind().to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        match conflict {
            Some(err) => Err(ProbeError::CacheConflict(err)),
            None => Ok(()),
        }
    }

    async fn execute(&self, run: &mut PipelineRun, input: &CommitInput, cancel: &CancelToken) {
        if run.tests.is_empty() {
            return;
        }
        let sources = Arc::new(input.workspace_files());
        let jobs: Vec<TestJob> = run
            .tests
            .iter()
            .map(|test| TestJob {
                test: test.clone(),
                sources: Arc::clone(&sources),
            })
            .collect();

        let runner = Arc::clone(&self.runner);
        let token = cancel.clone();
        let results = fan_out(jobs, self.config.concurrency_limit, move |job: TestJob| {
            let runner = Arc::clone(&runner);
            let cancel = token.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(runner.run(&job, &cancel).await)
            }
        })
        .await;

        run.outcomes
            .extend(results.into_iter().flatten().flatten());
    }
}

/// Run `work` over `items` with at most `limit` in flight.
///
/// Results line up with `items`; a task that panicked yields `None`.
async fn fan_out<I, T, F, Fut>(items: Vec<I>, limit: usize, work: F) -> Vec<Option<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let sem = Arc::new(Semaphore::new(limit.max(1)));
    let work = Arc::new(work);
    let mut tasks = Vec::with_capacity(items.len());

    for item in items {
        let sem = Arc::clone(&sem);
        let work = Arc::clone(&work);
        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire_owned().await.ok();
                work(item).await
            }
            .in_current_span(),
        );
        tasks.push(task);
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(value) => results.push(Some(value)),
            Err(err) => {
                warn!(error = %err, "worker task failed");
                results.push(None);
            }
        }
    }
    results
}

fn advance(run: &mut PipelineRun, to: RunState) {
    let from = run.state;
    if run.transition(to) {
        obs::emit_state_changed(&run.run_id.to_string(), from, to);
    }
}

fn note_cancel(run: &mut PipelineRun, cancel: &CancelToken) {
    if cancel.is_cancelled() && !run.cancelled {
        run.cancelled = true;
        obs::emit_run_cancelled(&run.run_id.to_string(), run.state);
    }
}

fn fail(run: &mut PipelineRun, err: ProbeError) {
    obs::emit_run_failed(&run.run_id.to_string(), run.state, &err);
    run.fail(err.to_string());
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::ScriptedBackend;
    use crate::sandbox::fakes::ScriptedExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn orchestrator(config: EngineConfig) -> Result<Orchestrator> {
        Orchestrator::new(
            config,
            Arc::new(ScriptedBackend::new("m")),
            Arc::new(FingerprintCache::new(16)),
            Arc::new(ScriptedExecutor::new()),
        )
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig {
            concurrency_limit: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            orchestrator(config),
            Err(ProbeError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order_and_bounds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));

        let results = fan_out((0..10u64).collect(), 3, move |i: u64| {
            let in_flight = Arc::clone(&f);
            let peak = Arc::clone(&p);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * (10 - i))).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await;

        let values: Vec<u64> = results.into_iter().flatten().collect();
        assert_eq!(values, (0..10).map(|i| i * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_empty_commit_is_done() {
        let orch = orchestrator(EngineConfig::default()).unwrap();
        let run = orch
            .run(CommitInput::new("empty", ""), CancelToken::new())
            .await;
        assert_eq!(run.state, RunState::Done);
        assert!(run.units.is_empty());
        assert_eq!(run.aggregated.as_ref().unwrap().commit_score, 0.0);
        assert_eq!(run.state_history.len(), 7);
    }

    #[tokio::test]
    async fn test_malformed_commit_fails_in_extracting() {
        let orch = orchestrator(EngineConfig::default()).unwrap();
        let diff = "--- a/x.py\n+++ b/x.py\n@@ broken @@\n+x\n";
        let run = orch.run(CommitInput::new("bad", diff), CancelToken::new()).await;
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.failure.as_ref().unwrap().state, RunState::Extracting);
    }
}
