//! Core data model for the multi-expert consensus engine.
//!
//! Entities are plain value records — no back pointers — so that a cached
//! `DebateResult` is a tree, not a graph, and can be deep-copied cheaply on
//! cache read.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Catalog entry for one external expert. Immutable after registry init.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpertDescriptor {
    pub id: String,
    pub display_name: String,
    pub role_tag: String,
    pub expertise: String,
    /// Non-negative; `0.0` means "free".
    pub relative_cost: f64,
    /// 1..5.
    pub relative_speed: u8,
    pub specialties: Vec<String>,
}

/// Focus role assigned to a replica instance of an expert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FocusLabel {
    General,
    Conservative,
    Innovative,
    Optimizing,
    Synthesizer,
    /// `alternative-k`, k = instance index minus 3.
    Alternative(u32),
}

impl FocusLabel {
    pub fn as_str(&self) -> String {
        match self {
            FocusLabel::General => "general".to_string(),
            FocusLabel::Conservative => "conservative".to_string(),
            FocusLabel::Innovative => "innovative".to_string(),
            FocusLabel::Optimizing => "optimizing".to_string(),
            FocusLabel::Synthesizer => "synthesizer".to_string(),
            FocusLabel::Alternative(k) => format!("alternative-{k}"),
        }
    }
}

/// Per-run, per-replica configuration derived by `InstanceConfigBuilder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertInstanceSpec {
    pub expert_id: String,
    pub instance_index: u32,
    pub replica_count: u32,
    pub seed: u64,
    pub temperature: f64,
    pub focus_label: FocusLabel,
    pub instructions_text: Option<String>,
}

/// Source of a `QuestionAnalysis`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisSource {
    Analyzer,
    FallbackHeuristic,
    UserDirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Trivial,
    Low,
    Medium,
    High,
    Critical,
}

impl ComplexityLevel {
    /// Thresholding of the [0,1] complexity score into a discrete level.
    pub fn from_score(score: f64) -> Self {
        if score < 0.2 {
            ComplexityLevel::Trivial
        } else if score < 0.4 {
            ComplexityLevel::Low
        } else if score < 0.6 {
            ComplexityLevel::Medium
        } else if score < 0.8 {
            ComplexityLevel::High
        } else {
            ComplexityLevel::Critical
        }
    }

    /// Base replica-count ceiling for this complexity level (§4.G).
    pub fn base_replica_cap(&self) -> u32 {
        match self {
            ComplexityLevel::Trivial => 2,
            ComplexityLevel::Low => 3,
            ComplexityLevel::Medium => 4,
            ComplexityLevel::High => 5,
            ComplexityLevel::Critical => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriticalityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl CriticalityLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 0.4 {
            CriticalityLevel::Low
        } else if score < 0.7 {
            CriticalityLevel::Medium
        } else if score < 0.9 {
            CriticalityLevel::High
        } else {
            CriticalityLevel::Critical
        }
    }

    /// Replica-count multiplier applied before clamping to the complexity cap (§4.G).
    pub fn multiplier(&self) -> f64 {
        match self {
            CriticalityLevel::Low => 1.0,
            CriticalityLevel::Medium => 1.2,
            CriticalityLevel::High => 1.5,
            CriticalityLevel::Critical => 2.0,
        }
    }
}

/// Per-run assessment of a question, produced by the Analyzer collaborator or
/// the FallbackHeuristic, or supplied directly by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAnalysis {
    pub category: String,
    pub complexity: Option<f64>,
    pub criticality: Option<f64>,
    pub urgency: Option<f64>,
    pub context_clues: Vec<String>,
    pub reasoning_text: Option<String>,
    pub confidence_of_analysis: Option<f64>,
    pub source: AnalysisSource,
}

impl QuestionAnalysis {
    pub fn complexity_level(&self) -> ComplexityLevel {
        ComplexityLevel::from_score(self.complexity.unwrap_or(0.5))
    }

    pub fn criticality_level(&self) -> CriticalityLevel {
        CriticalityLevel::from_score(self.criticality.unwrap_or(0.3))
    }
}

/// Where a Proposal's text ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalOrigin {
    Single,
    Synthesized,
    FallbackLongest,
    /// Every replica invocation failed; `text` is `None`.
    AllFailed,
}

/// One expert's first-round answer (possibly synthesized from replicas).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub expert_id: String,
    /// `None` marks a failed proposal; the debate continues with fewer experts.
    pub text: Option<String>,
    pub produced_at_monotonic_ms: u64,
    pub duration_ms: u64,
    pub replica_count: u32,
    pub origin: ProposalOrigin,
}

impl Proposal {
    pub fn is_usable(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// Output of the Evaluator: the best expert plus a per-expert score table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ranking {
    pub best_expert_id: String,
    pub per_expert: HashMap<String, f64>,
    pub notes: Option<String>,
    /// Per-expert strengths/weaknesses, when the evaluator provides them —
    /// consumed by Round 3's evaluation table (§4.H step 5).
    pub per_expert_detail: HashMap<String, EvaluationDetail>,
    /// True if this ranking came from the evaluator-failure fallback
    /// (longest non-empty text wins, score fixed at 50) rather than D.rank.
    pub is_fallback: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationDetail {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
}

impl Ranking {
    /// Invariant check: best id is present and its score is the max.
    pub fn is_consistent(&self) -> bool {
        let Some(&best_score) = self.per_expert.get(&self.best_expert_id) else {
            return false;
        };
        self.per_expert.values().all(|&s| s <= best_score)
    }
}

/// Per-proposal verification signal produced by the CrossVerifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalVerification {
    pub fact_accuracy: f64,
    pub code_correctness: f64,
    pub security_verified: bool,
    pub challenges_passed: u32,
    pub total_challenges: u32,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

/// Output of the CrossVerifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub enabled: bool,
    pub per_proposal: HashMap<String, ProposalVerification>,
    pub overall_confidence: f64,
    pub security_verified_overall: bool,
}

impl VerificationReport {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            per_proposal: HashMap::new(),
            overall_confidence: 0.0,
            security_verified_overall: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfidenceLevel {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ConfidenceLevel {
    /// Thresholds are inclusive on the lower bound (§4.J).
    pub fn from_score(score: f64) -> Self {
        if score < 20.0 {
            ConfidenceLevel::VeryLow
        } else if score < 40.0 {
            ConfidenceLevel::Low
        } else if score < 60.0 {
            ConfidenceLevel::Medium
        } else if score < 80.0 {
            ConfidenceLevel::High
        } else {
            ConfidenceLevel::VeryHigh
        }
    }
}

/// A stable reason code explaining a depressed confidence score (supplemented
/// feature, §10.5 of SPEC_FULL.md) — callers branch on these instead of parsing
/// free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfidenceReasonCode {
    EvaluatorFallbackUsed,
    VerificationDisabled,
    VerificationFailedChallenges,
    HighScoreDispersion,
    FewSurvivingExperts,
    SecurityNotVerified,
}

/// Output of the ConfidenceScorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub score: f64,
    pub level: ConfidenceLevel,
    pub factors: ConfidenceFactors,
    pub recommendation: String,
    pub reasons: Vec<ConfidenceReasonCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub evaluator_score: f64,
    pub verification_confidence: Option<f64>,
    pub score_dispersion: f64,
    pub surviving_experts: usize,
    pub used_fallback_ranking: bool,
}

/// Final, returned and cached, result of one debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateResult {
    pub question: String,
    pub workdir: String,
    pub selection_analysis: QuestionAnalysis,
    pub experts_used: Vec<String>,
    pub proposals: HashMap<String, Proposal>,
    pub ranking: Ranking,
    pub improvements: HashMap<String, String>,
    pub verification: Option<VerificationReport>,
    pub final_text: String,
    pub confidence: ConfidenceReport,
    pub response_time_ms: u64,
    pub from_cache: bool,
    pub cached_at: Option<u64>,
}

/// A stored cache row, keyed by content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub result: DebateResult,
    pub stored_at_wall_ms: u64,
    pub project_fingerprint: Option<String>,
    pub observed_confidence: f64,
    pub estimated_tokens: u64,
    pub estimated_cost: f64,
    pub workdir: String,
    pub requested_expert_ids: Vec<String>,
    pub manifest_mtime_ms: Option<u64>,
}

/// One classified retry attempt summary, surfaced in logs/progress (see also
/// [`crate::error::RetryAttempt`] for the live in-flight form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStats {
    pub attempts: u64,
    pub successes: u64,
    pub retries_by_error_kind: HashMap<String, u64>,
    pub total_retries: u64,
}

impl Default for RetryStats {
    fn default() -> Self {
        Self {
            attempts: 0,
            successes: 0,
            retries_by_error_kind: HashMap::new(),
            total_retries: 0,
        }
    }
}

impl RetryStats {
    pub fn avg_retries_per_success(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            self.total_retries as f64 / self.successes as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertTiming {
    pub expert_id: String,
    pub duration: Duration,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpertStatus {
    Waiting,
    Starting,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Initializing,
    CacheChecking,
    Selecting,
    Round1,
    Evaluating,
    Verifying,
    Round2,
    Synthesizing,
    Scoring,
    Storing,
    Done,
}

/// Emitted at each phase transition and on every per-expert state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub percentage: f64,
    pub expert_id: Option<String>,
    pub status: Option<ExpertStatus>,
    pub message: Option<String>,
    pub timestamp_monotonic_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_thresholds() {
        assert_eq!(ComplexityLevel::from_score(0.0), ComplexityLevel::Trivial);
        assert_eq!(ComplexityLevel::from_score(0.19), ComplexityLevel::Trivial);
        assert_eq!(ComplexityLevel::from_score(0.2), ComplexityLevel::Low);
        assert_eq!(ComplexityLevel::from_score(0.59), ComplexityLevel::Medium);
        assert_eq!(ComplexityLevel::from_score(0.8), ComplexityLevel::Critical);
    }

    #[test]
    fn confidence_thresholds_inclusive_lower() {
        assert_eq!(ConfidenceLevel::from_score(19.99), ConfidenceLevel::VeryLow);
        assert_eq!(ConfidenceLevel::from_score(20.0), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(79.99), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(80.0), ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn ranking_consistency() {
        let mut per_expert = HashMap::new();
        per_expert.insert("a".to_string(), 90.0);
        per_expert.insert("b".to_string(), 70.0);
        let ranking = Ranking {
            best_expert_id: "a".to_string(),
            per_expert,
            notes: None,
            per_expert_detail: HashMap::new(),
            is_fallback: false,
        };
        assert!(ranking.is_consistent());
    }

    #[test]
    fn focus_label_alternative_formatting() {
        assert_eq!(FocusLabel::Alternative(1).as_str(), "alternative-1");
    }
}
