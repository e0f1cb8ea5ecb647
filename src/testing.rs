//! Deterministic in-process test doubles for the collaborator interfaces
//! (§9 "must remain operable with deterministic local implementations for
//! tests"). Used by this crate's own component tests and reusable by an
//! embedder's integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ClassifiedError;
use crate::evaluator::{Analyzer, AnalyzerError, Evaluator, EvaluatorError};
use crate::types::{
    AnalysisSource, EvaluationDetail, ExpertInstanceSpec, QuestionAnalysis, Ranking,
};
use crate::verify::CrossVerifier;
use crate::worker::ExpertWorker;

/// Always succeeds with a deterministic, expert-id-flavored answer whose
/// length is controlled by `verbosity` — long enough for two experts to
/// produce distinguishable rankings.
pub struct DeterministicWorker {
    pub verbosity: HashMap<String, usize>,
}

impl DeterministicWorker {
    pub fn new() -> Self {
        Self {
            verbosity: HashMap::new(),
        }
    }

    pub fn with_verbosity(mut self, expert_id: impl Into<String>, sentences: usize) -> Self {
        self.verbosity.insert(expert_id.into(), sentences);
        self
    }
}

impl Default for DeterministicWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExpertWorker for DeterministicWorker {
    async fn invoke(
        &self,
        expert_id: &str,
        _prompt: &str,
        _workdir: &str,
        instance_spec: Option<&ExpertInstanceSpec>,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> Result<String, ClassifiedError> {
        let sentences = self.verbosity.get(expert_id).copied().unwrap_or(1);
        let focus = instance_spec.map(|s| s.focus_label.as_str()).unwrap_or_else(|| "general".to_string());
        let body = (0..sentences)
            .map(|i| format!("{expert_id} point {i} ({focus})."))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(format!("Answer from {expert_id}: {body}"))
    }
}

/// Fails the first `failures_before_success` calls, then succeeds — used to
/// exercise the RetryController's success-after-transient-failure path
/// end-to-end.
pub struct FlakyWorker {
    failures_before_success: u32,
    calls: AtomicU32,
}

impl FlakyWorker {
    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ExpertWorker for FlakyWorker {
    async fn invoke(
        &self,
        expert_id: &str,
        _prompt: &str,
        _workdir: &str,
        _instance_spec: Option<&ExpertInstanceSpec>,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> Result<String, ClassifiedError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            Err(ClassifiedError::Network("simulated transient failure".to_string()))
        } else {
            Ok(format!("Answer from {expert_id} after {n} retries."))
        }
    }
}

/// Hangs until `cancel` fires, then returns a timeout-classified error —
/// used to prove that cancellation actually reaches in-flight invocations
/// instead of being silently ignored (§5 "must propagate cancellation to
/// all in-flight expert tasks"), unlike the other doubles in this module
/// which take `_cancel` and never look at it.
pub struct CancellableWorker;

#[async_trait]
impl ExpertWorker for CancellableWorker {
    async fn invoke(
        &self,
        _expert_id: &str,
        _prompt: &str,
        _workdir: &str,
        _instance_spec: Option<&ExpertInstanceSpec>,
        _deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<String, ClassifiedError> {
        cancel.cancelled().await;
        Err(ClassifiedError::Timeout(Duration::from_secs(0)))
    }
}

/// Always fails — used to drive an expert into the "failed proposal" branch.
pub struct FailingWorker;

#[async_trait]
impl ExpertWorker for FailingWorker {
    async fn invoke(
        &self,
        _expert_id: &str,
        _prompt: &str,
        _workdir: &str,
        _instance_spec: Option<&ExpertInstanceSpec>,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> Result<String, ClassifiedError> {
        Err(ClassifiedError::Unknown("simulated permanent failure".to_string()))
    }
}

/// Ranks by text length — longest proposal wins, score scaled into `[50,
/// 100]`. Deterministic and order-independent, matching §8's "isolated
/// failure" property (best id depends only on surviving proposals' content).
pub struct DeterministicEvaluator;

#[async_trait]
impl Evaluator for DeterministicEvaluator {
    async fn rank(
        &self,
        _question: &str,
        proposals: &HashMap<String, String>,
    ) -> Result<Ranking, EvaluatorError> {
        if proposals.is_empty() {
            return Err(EvaluatorError::Unparseable);
        }
        let max_len = proposals.values().map(|t| t.chars().count()).max().unwrap_or(1).max(1);
        let per_expert: HashMap<String, f64> = proposals
            .iter()
            .map(|(id, text)| {
                let ratio = text.chars().count() as f64 / max_len as f64;
                (id.clone(), 50.0 + 50.0 * ratio)
            })
            .collect();
        let per_expert_detail: HashMap<String, EvaluationDetail> = proposals
            .keys()
            .map(|id| {
                (
                    id.clone(),
                    EvaluationDetail {
                        strengths: vec!["covers the question directly".to_string()],
                        weaknesses: vec![],
                    },
                )
            })
            .collect();

        let best_expert_id = per_expert
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap().then(b.0.cmp(a.0)))
            .map(|(id, _)| id.clone())
            .unwrap();

        Ok(Ranking {
            best_expert_id,
            per_expert,
            notes: Some("deterministic test evaluator: longest proposal wins".to_string()),
            per_expert_detail,
            is_fallback: false,
        })
    }
}

/// Returns a fixed `QuestionAnalysis`, letting a test pin down the selection
/// plan without exercising [`crate::selector::FallbackHeuristic`].
pub struct FixedAnalyzer {
    pub analysis: QuestionAnalysis,
}

impl FixedAnalyzer {
    pub fn new(category: impl Into<String>, complexity: f64, criticality: f64) -> Self {
        Self {
            analysis: QuestionAnalysis {
                category: category.into(),
                complexity: Some(complexity),
                criticality: Some(criticality),
                urgency: Some(0.3),
                context_clues: Vec::new(),
                reasoning_text: Some("fixed test analysis".to_string()),
                confidence_of_analysis: Some(0.9),
                source: AnalysisSource::Analyzer,
            },
        }
    }
}

#[async_trait]
impl Analyzer for FixedAnalyzer {
    async fn analyze(&self, _question: &str) -> Result<QuestionAnalysis, AnalyzerError> {
        Ok(self.analysis.clone())
    }
}

/// No-op verifier that reports full confidence without making any calls —
/// lets end-to-end tests exercise the "verification enabled" branch without
/// a real LLM-backed [`crate::verify::LlmCrossVerifier`].
pub struct StubVerifier {
    pub confidence: f64,
    pub security_verified: bool,
}

impl StubVerifier {
    pub fn new(confidence: f64, security_verified: bool) -> Self {
        Self {
            confidence,
            security_verified,
        }
    }
}

#[async_trait]
impl CrossVerifier for StubVerifier {
    async fn verify(
        &self,
        _question: &str,
        proposals: &HashMap<String, crate::types::Proposal>,
        _best_expert_id: &str,
    ) -> crate::types::VerificationReport {
        let per_proposal = proposals
            .iter()
            .filter(|(_, p)| p.is_usable())
            .map(|(id, _)| {
                (
                    id.clone(),
                    crate::types::ProposalVerification {
                        fact_accuracy: self.confidence,
                        code_correctness: 1.0,
                        security_verified: self.security_verified,
                        challenges_passed: 5,
                        total_challenges: 5,
                        confidence: self.confidence,
                        warnings: Vec::new(),
                    },
                )
            })
            .collect();
        crate::types::VerificationReport {
            enabled: true,
            per_proposal,
            overall_confidence: self.confidence,
            security_verified_overall: self.security_verified,
        }
    }
}

/// Captures every [`crate::learning::LearningRecord`] emitted during a test
/// run, in order.
#[derive(Default)]
pub struct RecordingLearningSink {
    records: Mutex<Vec<crate::learning::LearningRecord>>,
}

impl RecordingLearningSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<crate::learning::LearningRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl crate::learning::LearningSink for RecordingLearningSink {
    fn record(&self, record: crate::learning::LearningRecord) {
        self.records.lock().unwrap().push(record);
    }
}
