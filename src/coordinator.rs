//! Coordinator — the public entry point, driving Cache↓ → Selector →
//! DebateRunner → ConfidenceScorer → Cache↑ (§4.M).
//!
//! Selection always runs first, even on what will turn out to be a cache
//! hit: the cache key is content-addressed over the selected plan (§6), so
//! the plan must exist before a key can be computed. This is the resolution
//! to an ambiguity in the source data-flow diagram, recorded in DESIGN.md.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cache::{compute_cache_key, CacheKeyInput, ResultCache};
use crate::config::EngineConfig;
use crate::debate::DebateRunner;
use crate::error::CoreError;
use crate::evaluator::{Analyzer, Evaluator};
use crate::invalidator::{CacheInvalidator, InvalidationContext};
use crate::learning::{LearningRecord, LearningSink};
use crate::log::{self, RequestLogRecord};
use crate::progress::{phase_event, ProgressSink};
use crate::project_state;
use crate::registry::ExpertRegistry;
use crate::retry::RetryController;
use crate::selector::select;
use crate::types::{DebateResult, Phase};
use crate::verify::{CrossVerifier, VerificationTrigger};
use crate::worker::ExpertWorker;
use crate::confidence;

/// Per-call knobs, mirroring the `options` bag of §6.
#[derive(Debug, Clone, Default)]
pub struct DebateOptions {
    pub bypass_cache: bool,
    pub force_verification: bool,
    pub skip_verification: bool,
    /// Overrides `EngineConfig::retry::overall_deadline` for this call only.
    pub deadline_ms: Option<u64>,
    /// Prepends a fixed marker to the first expert's Round 1 prompt.
    pub ultrathink: bool,
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_monotonic_nanos() -> u64 {
    let base = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    base.wrapping_add(REQUEST_SEQ.fetch_add(1, Ordering::Relaxed))
}

fn now_wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Binds every collaborator named in §9 ("injected at Coordinator
/// construction... process-wide sharing is fine but must be explicit").
pub struct Coordinator {
    registry: Arc<ExpertRegistry>,
    worker: Arc<dyn ExpertWorker>,
    retry: Arc<RetryController>,
    evaluator: Arc<dyn Evaluator>,
    analyzer: Option<Arc<dyn Analyzer>>,
    verifier: Option<Arc<dyn CrossVerifier>>,
    cache: Arc<ResultCache>,
    invalidator: Arc<CacheInvalidator>,
    learning: Arc<dyn LearningSink>,
    log_dir: Option<PathBuf>,
    config: EngineConfig,
    /// Process-wide cap on in-flight expert invocations (§5), shared across
    /// every call to [`Coordinator::debate`].
    concurrency: Arc<Semaphore>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ExpertRegistry>,
        worker: Arc<dyn ExpertWorker>,
        evaluator: Arc<dyn Evaluator>,
        analyzer: Option<Arc<dyn Analyzer>>,
        verifier: Option<Arc<dyn CrossVerifier>>,
        learning: Arc<dyn LearningSink>,
        config: EngineConfig,
        log_dir: Option<PathBuf>,
    ) -> Self {
        let cache = Arc::new(ResultCache::new(
            config.cache.max_entries,
            config.cost_per_token,
            config.cache.persistence_path.clone(),
        ));
        let invalidator = Arc::new(CacheInvalidator::new(config.cache.max_age, config.cache.min_confidence));
        let concurrency = Arc::new(Semaphore::new(config.concurrency.max_concurrent_invocations));

        Self {
            registry,
            worker,
            retry: Arc::new(RetryController::new()),
            evaluator,
            analyzer,
            verifier,
            cache,
            invalidator,
            learning,
            log_dir,
            config,
            concurrency,
        }
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.cache.stats()
    }

    /// The single public operation (§4.M, §6). `workdir` is expected to be
    /// an absolute path or the sentinel `"current"`; the core treats it as
    /// an opaque string key and never resolves it itself.
    pub async fn debate(
        &self,
        question: &str,
        workdir: &str,
        expert_spec: Option<&str>,
        options: DebateOptions,
        progress: &dyn ProgressSink,
    ) -> Result<DebateResult, CoreError> {
        if question.trim().is_empty() {
            return Err(CoreError::EmptyQuestion);
        }

        let start = Instant::now();
        let monotonic_nanos = next_monotonic_nanos();
        let deadline = options
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.retry.overall_deadline);
        let cancel = CancellationToken::new();

        progress.emit(phase_event(Phase::Initializing, 0.0, "initializing", 0));

        // `tokio::select!` drops every losing branch's future before running
        // the winning arm's body, so calling `cancel.cancel()` from inside a
        // losing arm is too late to reach anything nested in the already-
        // dropped `run()` future (in-flight subprocess children included).
        // Looping keeps `run_fut` alive across the cancellation so it is
        // polled again afterward and can actually observe `cancel` (§5 "must
        // propagate cancellation to all in-flight expert tasks").
        let run_fut = self.run(question, workdir, expert_spec, &options, progress, cancel.clone(), start, monotonic_nanos);
        tokio::pin!(run_fut);
        let sleep = tokio::time::sleep(deadline);
        tokio::pin!(sleep);
        let mut deadline_hit = false;

        loop {
            tokio::select! {
                biased;
                result = &mut run_fut => {
                    if !deadline_hit {
                        return result;
                    }
                    let elapsed = start.elapsed();
                    self.write_log(
                        monotonic_nanos,
                        RequestLogRecord::failure(None, self.retry.stats().await, format!(
                            "deadline exceeded after {elapsed:?} (limit {deadline:?})"
                        )),
                    );
                    return Err(CoreError::DeadlineExceeded { elapsed, limit: deadline });
                }
                _ = &mut sleep, if !deadline_hit => {
                    deadline_hit = true;
                    cancel.cancel();
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        question: &str,
        workdir: &str,
        expert_spec: Option<&str>,
        options: &DebateOptions,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
        start: Instant,
        monotonic_nanos: u64,
    ) -> Result<DebateResult, CoreError> {
        progress.emit(phase_event(
            Phase::Selecting,
            5.0,
            "selecting experts",
            start.elapsed().as_millis() as u64,
        ));

        let analyzer_ref = self.analyzer.as_deref();
        let mut plan = select(question, expert_spec, analyzer_ref, &self.registry).await;
        if expert_spec.is_some() && plan.experts.is_empty() {
            tracing::warn!("coordinator: direct expert spec matched no known ids, falling back to analyzer path");
            plan = select(question, None, analyzer_ref, &self.registry).await;
        }
        if plan.experts.is_empty() {
            self.write_log(
                monotonic_nanos,
                RequestLogRecord::failure(Some(plan.analysis.clone()), self.retry.stats().await, "insufficient experts: selector produced an empty plan"),
            );
            return Err(CoreError::InsufficientExperts { attempted: 0, succeeded: 0 });
        }

        progress.emit(phase_event(
            Phase::CacheChecking,
            10.0,
            "checking cache",
            start.elapsed().as_millis() as u64,
        ));

        let project_fingerprint = Some(project_state::compute_fingerprint(
            workdir,
            &self.config.cache.tracked_extensions,
            self.config.cache.max_fingerprint_files,
        ));
        let expert_replica_plan: Vec<(String, u32)> = plan
            .experts
            .iter()
            .map(|p| (p.expert_id.clone(), p.replica_count))
            .collect();
        let requested_expert_ids: Vec<String> = plan.experts.iter().map(|p| p.expert_id.clone()).collect();
        let use_analyzer = expert_spec.is_none();

        let cache_key = compute_cache_key(&CacheKeyInput {
            normalized_question: question.to_string(),
            category: plan.analysis.category.clone(),
            complexity_level: format!("{:?}", plan.analysis.complexity_level()),
            workdir: workdir.to_string(),
            expert_replica_plan,
            use_analyzer,
            project_fingerprint: project_fingerprint.clone(),
        });

        if !options.bypass_cache {
            let context = InvalidationContext {
                now_wall_ms: now_wall_ms(),
                project_fingerprint: project_fingerprint.clone(),
                workdir: workdir.to_string(),
                requested_expert_ids: requested_expert_ids.clone(),
                user_requested_bypass: false,
                manifest_mtime_ms: None,
                project_state_changed: None,
            };
            if let Some(mut hit) = self.cache.lookup(&cache_key, &self.invalidator, &context) {
                hit.response_time_ms = start.elapsed().as_millis() as u64;
                progress.emit(phase_event(Phase::Done, 100.0, "cache hit", start.elapsed().as_millis() as u64));
                self.write_log(monotonic_nanos, RequestLogRecord::success(hit.clone(), self.retry.stats().await));
                return Ok(hit);
            }
        }

        let trigger = VerificationTrigger::from_context(
            question,
            &plan.analysis.category,
            options.force_verification,
            options.skip_verification,
        );

        let debate_runner = DebateRunner::new(
            self.worker.clone(),
            self.retry.clone(),
            self.evaluator.clone(),
            self.verifier.clone(),
            self.concurrency.clone(),
        );

        let outcome = match debate_runner
            .run(
                question,
                workdir,
                &self.registry,
                &plan.experts,
                trigger,
                &self.config.retry,
                progress,
                cancel,
                options.ultrathink,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.write_log(
                    monotonic_nanos,
                    RequestLogRecord::failure(Some(plan.analysis.clone()), self.retry.stats().await, err.to_string()),
                );
                return Err(err);
            }
        };

        progress.emit(phase_event(
            Phase::Scoring,
            92.0,
            "scoring confidence",
            start.elapsed().as_millis() as u64,
        ));

        let surviving_experts = outcome.proposals.values().filter(|p| p.is_usable()).count();
        let confidence_report = confidence::score(&outcome.ranking, outcome.verification.as_ref(), surviving_experts);

        let result = DebateResult {
            question: question.to_string(),
            workdir: workdir.to_string(),
            selection_analysis: plan.analysis.clone(),
            experts_used: outcome.experts_used,
            proposals: outcome.proposals,
            ranking: outcome.ranking,
            improvements: outcome.improvements,
            verification: outcome.verification,
            final_text: truncate_synthesis(&outcome.final_text, self.config.max_synthesis_chars),
            confidence: confidence_report.clone(),
            response_time_ms: start.elapsed().as_millis() as u64,
            from_cache: false,
            cached_at: None,
        };

        progress.emit(phase_event(
            Phase::Storing,
            96.0,
            "storing result",
            start.elapsed().as_millis() as u64,
        ));

        self.cache.store(
            cache_key,
            result.clone(),
            project_fingerprint,
            confidence_report.score / 100.0,
            None,
        );
        self.cache.record_fresh_response(result.response_time_ms);

        self.learning.record(LearningRecord {
            category: result.selection_analysis.category.clone(),
            experts_used: result.experts_used.clone(),
            winner: result.ranking.best_expert_id.clone(),
            per_expert_score: result.ranking.per_expert.clone(),
            per_expert_duration_ms: result
                .proposals
                .iter()
                .map(|(id, p)| (id.clone(), p.duration_ms))
                .collect(),
            cost_reduction_pct: None,
        });

        progress.emit(phase_event(
            Phase::Done,
            100.0,
            format!("done: confidence {:?}", confidence_report.level),
            start.elapsed().as_millis() as u64,
        ));

        self.write_log(monotonic_nanos, RequestLogRecord::success(result.clone(), self.retry.stats().await));

        Ok(result)
    }

    fn write_log(&self, monotonic_nanos: u64, record: RequestLogRecord) {
        let Some(dir) = &self.log_dir else {
            return;
        };
        if let Err(err) = log::write_request_log(dir, monotonic_nanos, &record) {
            tracing::warn!(error = %err, "coordinator: failed to write request log");
        }
    }
}

/// Bounds the synthesized answer (§9 Open Question: source leaves this
/// unbounded; we pick a finite default via `EngineConfig`).
fn truncate_synthesis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{NoopProgressSink, RecordingProgressSink};
    use crate::registry::default_registry;
    use crate::testing::{
        CancellableWorker, DeterministicEvaluator, DeterministicWorker, FailingWorker, FixedAnalyzer,
        FlakyWorker, RecordingLearningSink, StubVerifier,
    };
    use std::time::Duration as StdDuration;

    fn engine_config_fast() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.retry.max_retries = 1;
        config.retry.initial_delay = StdDuration::from_millis(1);
        config.retry.max_delay = StdDuration::from_millis(2);
        config.retry.overall_deadline = StdDuration::from_secs(30);
        config
    }

    fn coordinator_with(worker: Arc<dyn ExpertWorker>) -> Coordinator {
        Coordinator::new(
            Arc::new(default_registry()),
            worker,
            Arc::new(DeterministicEvaluator),
            Some(Arc::new(FixedAnalyzer::new("general/factual", 0.1, 0.1))),
            None,
            Arc::new(RecordingLearningSink::new()),
            engine_config_fast(),
            None,
        )
    }

    #[tokio::test]
    async fn empty_question_rejected_before_any_work() {
        let coordinator = coordinator_with(Arc::new(DeterministicWorker::new()));
        let err = coordinator
            .debate("   ", "/tmp", None, DebateOptions::default(), &NoopProgressSink)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::EmptyQuestion));
    }

    #[tokio::test]
    async fn trivial_factual_question_produces_high_confidence_result() {
        let coordinator = coordinator_with(Arc::new(DeterministicWorker::new()));
        let result = coordinator
            .debate(
                "What is 2+2? Reply with just the number.",
                "/tmp/project-a",
                None,
                DebateOptions::default(),
                &NoopProgressSink,
            )
            .await
            .unwrap();
        assert!(!result.from_cache);
        assert!(result.experts_used.len() >= 1);
        assert!(result.confidence.score >= 0.0 && result.confidence.score <= 100.0);
    }

    #[tokio::test]
    async fn second_identical_call_hits_cache() {
        let coordinator = coordinator_with(Arc::new(DeterministicWorker::new()));
        let question = "What is 2+2? Reply with just the number.";
        let first = coordinator
            .debate(question, "/tmp/project-b", None, DebateOptions::default(), &NoopProgressSink)
            .await
            .unwrap();
        assert!(!first.from_cache);

        let second = coordinator
            .debate(question, "/tmp/project-b", None, DebateOptions::default(), &NoopProgressSink)
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.final_text, first.final_text);
        assert_eq!(coordinator.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn bypass_cache_always_runs_fresh() {
        let coordinator = coordinator_with(Arc::new(DeterministicWorker::new()));
        let question = "What is 2+2? Reply with just the number.";
        let options = DebateOptions {
            bypass_cache: true,
            ..Default::default()
        };
        coordinator
            .debate(question, "/tmp/project-c", None, options.clone(), &NoopProgressSink)
            .await
            .unwrap();
        let second = coordinator
            .debate(question, "/tmp/project-c", None, options, &NoopProgressSink)
            .await
            .unwrap();
        assert!(!second.from_cache);
    }

    #[tokio::test]
    async fn security_question_triggers_verification() {
        let registry = Arc::new(default_registry());
        let coordinator = Coordinator::new(
            registry.clone(),
            Arc::new(DeterministicWorker::new().with_verbosity("claude", 5).with_verbosity("gpt", 2)),
            Arc::new(DeterministicEvaluator),
            Some(Arc::new(FixedAnalyzer::new("security", 0.4, 0.8))),
            Some(Arc::new(StubVerifier::new(0.9, true))),
            Arc::new(RecordingLearningSink::new()),
            engine_config_fast(),
            None,
        );

        let result = coordinator
            .debate(
                "How should I store user passwords?",
                "/tmp/project-d",
                None,
                DebateOptions::default(),
                &NoopProgressSink,
            )
            .await
            .unwrap();

        let verification = result.verification.expect("verification should have run");
        assert!(verification.enabled);
        assert!(verification.security_verified_overall);
    }

    #[tokio::test]
    async fn direct_spec_with_only_unknown_ids_falls_back_to_analyzer() {
        let coordinator = coordinator_with(Arc::new(DeterministicWorker::new()));
        let result = coordinator
            .debate(
                "what is the best architecture for this?",
                "/tmp/project-e",
                Some("bogus1,bogus2"),
                DebateOptions::default(),
                &NoopProgressSink,
            )
            .await
            .unwrap();
        assert_eq!(result.selection_analysis.category, "general/factual");
    }

    #[tokio::test]
    async fn all_experts_failing_yields_insufficient_experts() {
        let coordinator = coordinator_with(Arc::new(FailingWorker));
        let err = coordinator
            .debate(
                "anything at all",
                "/tmp/project-f",
                Some("claude:1,gpt:1"),
                DebateOptions::default(),
                &NoopProgressSink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientExperts { .. }));
    }

    #[tokio::test]
    async fn retry_success_records_retries_and_still_completes() {
        // Plan is two single-replica experts run sequentially (§5 Round 1
        // ordering); one retriable failure lands entirely within the first
        // expert's own attempt budget before the second expert is invoked.
        let coordinator = coordinator_with(Arc::new(FlakyWorker::new(1)));
        let result = coordinator
            .debate(
                "what is 2+2?",
                "/tmp/project-g",
                Some("claude:1,gpt:1"),
                DebateOptions::default(),
                &NoopProgressSink,
            )
            .await
            .unwrap();
        assert!(!result.final_text.is_empty());
    }

    #[tokio::test]
    async fn deadline_exceeded_cancels_in_flight_experts() {
        // CancellableWorker hangs forever unless `cancel` fires. If the
        // deadline race dropped the in-flight run() future before signalling
        // cancellation (or the signal never reached the worker), this would
        // hang past the outer timeout instead of returning promptly.
        let coordinator = coordinator_with(Arc::new(CancellableWorker));
        let options = DebateOptions {
            deadline_ms: Some(20),
            ..Default::default()
        };
        let result = tokio::time::timeout(
            StdDuration::from_secs(5),
            coordinator.debate(
                "what is 2+2?",
                "/tmp/project-i",
                Some("claude:1,gpt:1"),
                options,
                &NoopProgressSink,
            ),
        )
        .await
        .expect("debate() should return promptly once cancellation propagates, not hang past the deadline");

        assert!(matches!(result.unwrap_err(), CoreError::DeadlineExceeded { .. }));
    }

    #[tokio::test]
    async fn progress_events_reach_done_phase() {
        let coordinator = coordinator_with(Arc::new(DeterministicWorker::new()));
        let sink = RecordingProgressSink::new();
        coordinator
            .debate("what is 2+2?", "/tmp/project-h", None, DebateOptions::default(), &sink)
            .await
            .unwrap();
        let events = sink.events();
        assert!(events.iter().any(|e| e.phase == Phase::Initializing));
        assert!(events.iter().any(|e| e.phase == Phase::Done));
    }
}
