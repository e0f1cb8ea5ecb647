//! ConfidenceScorer — folds the evaluator score, verification outcome and
//! inter-expert dispersion into one reported confidence (§4.J, plus the
//! reason-coded explanations from the supplemented feature set).

use crate::dispersion::{normalize_scores, score_dispersion};
use crate::types::{
    ConfidenceFactors, ConfidenceLevel, ConfidenceReasonCode, ConfidenceReport, Ranking,
    VerificationReport,
};

const HIGH_DISPERSION_THRESHOLD: f64 = 0.6;
const FEW_SURVIVORS_THRESHOLD: usize = 2;

pub fn score(ranking: &Ranking, verification: Option<&VerificationReport>, surviving_experts: usize) -> ConfidenceReport {
    let evaluator_score = ranking.per_expert.get(&ranking.best_expert_id).copied().unwrap_or(0.0);
    let verification_confidence = verification.filter(|v| v.enabled).map(|v| v.overall_confidence);

    let final_score = match verification_confidence {
        Some(vc) => 0.8 * evaluator_score + 0.2 * vc * 100.0,
        None => evaluator_score,
    };

    let normalized = normalize_scores(ranking.per_expert.values().copied());
    let dispersion = score_dispersion(&normalized);

    let level = ConfidenceLevel::from_score(final_score);

    let mut reasons = Vec::new();
    if ranking.is_fallback {
        reasons.push(ConfidenceReasonCode::EvaluatorFallbackUsed);
    }
    match verification {
        None => reasons.push(ConfidenceReasonCode::VerificationDisabled),
        Some(report) if !report.enabled => reasons.push(ConfidenceReasonCode::VerificationDisabled),
        Some(report) => {
            let any_challenge_failed = report
                .per_proposal
                .values()
                .any(|p| p.challenges_passed < p.total_challenges);
            if any_challenge_failed {
                reasons.push(ConfidenceReasonCode::VerificationFailedChallenges);
            }
            if !report.security_verified_overall {
                reasons.push(ConfidenceReasonCode::SecurityNotVerified);
            }
        }
    }
    if dispersion >= HIGH_DISPERSION_THRESHOLD {
        reasons.push(ConfidenceReasonCode::HighScoreDispersion);
    }
    if surviving_experts <= FEW_SURVIVORS_THRESHOLD {
        reasons.push(ConfidenceReasonCode::FewSurvivingExperts);
    }

    let verification_passed = verification.is_some_and(|v| v.enabled && v.security_verified_overall);
    let recommendation = recommendation_text(level, verification.is_some(), verification_passed);

    ConfidenceReport {
        score: final_score,
        level,
        factors: ConfidenceFactors {
            evaluator_score,
            verification_confidence,
            score_dispersion: dispersion,
            surviving_experts,
            used_fallback_ranking: ranking.is_fallback,
        },
        recommendation,
        reasons,
    }
}

fn recommendation_text(level: ConfidenceLevel, was_verified: bool, verification_passed: bool) -> String {
    let qualifier = if was_verified {
        if verification_passed {
            "and verification passed"
        } else {
            "though verification raised concerns"
        }
    } else {
        "and verification did not run"
    };

    match level {
        ConfidenceLevel::VeryHigh => format!("Safe to act on directly, {qualifier}."),
        ConfidenceLevel::High => format!("Generally reliable, {qualifier}. Light review recommended."),
        ConfidenceLevel::Medium => format!("Treat as a strong starting point, {qualifier}. Review before acting."),
        ConfidenceLevel::Low => format!("Low confidence, {qualifier}. Verify independently before use."),
        ConfidenceLevel::VeryLow => format!("Very low confidence, {qualifier}. Do not act on this without independent verification."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ranking(best_score: f64, is_fallback: bool) -> Ranking {
        let mut per_expert = HashMap::new();
        per_expert.insert("a".to_string(), best_score);
        per_expert.insert("b".to_string(), best_score - 10.0);
        Ranking {
            best_expert_id: "a".to_string(),
            per_expert,
            notes: None,
            per_expert_detail: HashMap::new(),
            is_fallback,
        }
    }

    #[test]
    fn no_verification_uses_raw_evaluator_score() {
        let report = score(&ranking(85.0, false), None, 3);
        assert_eq!(report.score, 85.0);
        assert_eq!(report.level, ConfidenceLevel::VeryHigh);
        assert!(report.reasons.contains(&ConfidenceReasonCode::VerificationDisabled));
    }

    #[test]
    fn verification_blends_score() {
        let verification = VerificationReport {
            enabled: true,
            per_proposal: HashMap::new(),
            overall_confidence: 0.5,
            security_verified_overall: true,
        };
        let report = score(&ranking(80.0, false), Some(&verification), 3);
        // 0.8*80 + 0.2*0.5*100 = 64 + 10 = 74
        assert!((report.score - 74.0).abs() < 1e-9);
    }

    #[test]
    fn fallback_ranking_flagged() {
        let report = score(&ranking(60.0, true), None, 3);
        assert!(report.reasons.contains(&ConfidenceReasonCode::EvaluatorFallbackUsed));
    }

    #[test]
    fn few_survivors_flagged() {
        let report = score(&ranking(60.0, false), None, 2);
        assert!(report.reasons.contains(&ConfidenceReasonCode::FewSurvivingExperts));
    }
}
