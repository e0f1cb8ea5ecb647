//! CacheInvalidator — per-entry validity predicates and reason accounting
//! (§4.L).

use std::collections::HashMap;
use std::time::Duration;

use crate::types::CacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    TimeExpired,
    ContextChanged,
    LowConfidence,
    UserRequested,
    ProjectChanged,
    DependencyChanged,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::TimeExpired => "time_expired",
            InvalidationReason::ContextChanged => "context_changed",
            InvalidationReason::LowConfidence => "low_confidence",
            InvalidationReason::UserRequested => "user_requested",
            InvalidationReason::ProjectChanged => "project_changed",
            InvalidationReason::DependencyChanged => "dependency_changed",
        }
    }
}

/// The caller's view of "now", used to decide whether a cached entry is
/// still valid for a fresh request.
#[derive(Debug, Clone)]
pub struct InvalidationContext {
    pub now_wall_ms: u64,
    pub project_fingerprint: Option<String>,
    pub workdir: String,
    pub requested_expert_ids: Vec<String>,
    pub user_requested_bypass: bool,
    pub manifest_mtime_ms: Option<u64>,
    /// Result of the (optional) independent project-state tracker, already
    /// evaluated — `Some(true)` means it detected a material delta.
    pub project_state_changed: Option<bool>,
}

#[derive(Debug, Default)]
pub struct InvalidationStats {
    reason_counts: HashMap<&'static str, u64>,
    total_invalidations: u64,
}

impl InvalidationStats {
    pub fn record(&mut self, reasons: &[InvalidationReason]) {
        if reasons.is_empty() {
            return;
        }
        self.total_invalidations += 1;
        for reason in reasons {
            *self.reason_counts.entry(reason.as_str()).or_insert(0) += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.total_invalidations
    }

    pub fn counts(&self) -> &HashMap<&'static str, u64> {
        &self.reason_counts
    }
}

pub struct CacheInvalidator {
    pub max_age: Duration,
    pub min_confidence: f64,
}

impl CacheInvalidator {
    pub fn new(max_age: Duration, min_confidence: f64) -> Self {
        Self {
            max_age,
            min_confidence,
        }
    }

    /// Evaluates every predicate for `entry` against `context` (§4.L).
    pub fn check(&self, entry: &CacheEntry, context: &InvalidationContext) -> Vec<InvalidationReason> {
        let mut reasons = Vec::new();

        let age_ms = context.now_wall_ms.saturating_sub(entry.stored_at_wall_ms);
        if age_ms as u128 > self.max_age.as_millis() {
            reasons.push(InvalidationReason::TimeExpired);
        }

        let fingerprint_changed = context.project_fingerprint != entry.project_fingerprint;
        let workdir_changed = context.workdir != entry.workdir;
        let experts_changed = {
            let mut a = context.requested_expert_ids.clone();
            let mut b = entry.requested_expert_ids.clone();
            a.sort();
            b.sort();
            a != b
        };
        if fingerprint_changed || workdir_changed || experts_changed {
            reasons.push(InvalidationReason::ContextChanged);
        }

        if entry.observed_confidence < self.min_confidence {
            reasons.push(InvalidationReason::LowConfidence);
        }

        if context.user_requested_bypass {
            reasons.push(InvalidationReason::UserRequested);
        }

        if context.project_state_changed == Some(true) {
            reasons.push(InvalidationReason::ProjectChanged);
        }

        match (context.manifest_mtime_ms, entry.manifest_mtime_ms) {
            (Some(current), Some(stored)) if current > stored => {
                reasons.push(InvalidationReason::DependencyChanged);
            }
            _ => {}
        }

        reasons
    }

    pub fn is_valid(&self, entry: &CacheEntry, context: &InvalidationContext) -> bool {
        self.check(entry, context).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ConfidenceFactors, ConfidenceLevel, ConfidenceReport, DebateResult, QuestionAnalysis, Ranking,
    };
    use std::collections::HashMap as StdHashMap;

    fn base_result() -> DebateResult {
        DebateResult {
            question: "q".to_string(),
            workdir: "/tmp/proj".to_string(),
            selection_analysis: QuestionAnalysis {
                category: "general/analysis".to_string(),
                complexity: Some(0.2),
                criticality: Some(0.1),
                urgency: None,
                context_clues: vec![],
                reasoning_text: None,
                confidence_of_analysis: None,
                source: crate::types::AnalysisSource::UserDirect,
            },
            experts_used: vec!["claude".to_string()],
            proposals: StdHashMap::new(),
            ranking: Ranking {
                best_expert_id: "claude".to_string(),
                per_expert: StdHashMap::new(),
                notes: None,
                per_expert_detail: StdHashMap::new(),
                is_fallback: false,
            },
            improvements: StdHashMap::new(),
            verification: None,
            final_text: "answer".to_string(),
            confidence: ConfidenceReport {
                score: 80.0,
                level: ConfidenceLevel::VeryHigh,
                factors: ConfidenceFactors {
                    evaluator_score: 80.0,
                    verification_confidence: None,
                    score_dispersion: 0.0,
                    surviving_experts: 1,
                    used_fallback_ranking: false,
                },
                recommendation: "ok".to_string(),
                reasons: vec![],
            },
            response_time_ms: 10,
            from_cache: false,
            cached_at: None,
        }
    }

    fn base_entry() -> CacheEntry {
        CacheEntry {
            key: "abc".to_string(),
            result: base_result(),
            stored_at_wall_ms: 1_000_000,
            project_fingerprint: Some("fp1".to_string()),
            observed_confidence: 0.9,
            estimated_tokens: 100,
            estimated_cost: 0.001,
            workdir: "/tmp/proj".to_string(),
            requested_expert_ids: vec!["claude".to_string()],
            manifest_mtime_ms: Some(500),
        }
    }

    fn base_context() -> InvalidationContext {
        InvalidationContext {
            now_wall_ms: 1_000_100,
            project_fingerprint: Some("fp1".to_string()),
            workdir: "/tmp/proj".to_string(),
            requested_expert_ids: vec!["claude".to_string()],
            user_requested_bypass: false,
            manifest_mtime_ms: Some(500),
            project_state_changed: None,
        }
    }

    #[test]
    fn fresh_matching_entry_is_valid() {
        let invalidator = CacheInvalidator::new(Duration::from_secs(3600), 0.7);
        assert!(invalidator.is_valid(&base_entry(), &base_context()));
    }

    #[test]
    fn time_expired_fires_past_max_age() {
        let invalidator = CacheInvalidator::new(Duration::from_millis(50), 0.7);
        let reasons = invalidator.check(&base_entry(), &base_context());
        assert!(reasons.contains(&InvalidationReason::TimeExpired));
    }

    #[test]
    fn fingerprint_change_triggers_context_changed() {
        let invalidator = CacheInvalidator::new(Duration::from_secs(3600), 0.7);
        let mut context = base_context();
        context.project_fingerprint = Some("fp2".to_string());
        let reasons = invalidator.check(&base_entry(), &context);
        assert!(reasons.contains(&InvalidationReason::ContextChanged));
    }

    #[test]
    fn dependency_changed_when_manifest_is_newer() {
        let invalidator = CacheInvalidator::new(Duration::from_secs(3600), 0.7);
        let mut context = base_context();
        context.manifest_mtime_ms = Some(600);
        let reasons = invalidator.check(&base_entry(), &context);
        assert!(reasons.contains(&InvalidationReason::DependencyChanged));
    }

    #[test]
    fn stats_record_histogram() {
        let mut stats = InvalidationStats::default();
        stats.record(&[InvalidationReason::TimeExpired, InvalidationReason::LowConfidence]);
        stats.record(&[InvalidationReason::TimeExpired]);
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.counts()[&"time_expired"], 2);
        assert_eq!(stats.counts()[&"low_confidence"], 1);
    }
}
