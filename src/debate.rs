//! DebateRunner — the three-round Propose → Evaluate → (verify) → Improve →
//! Synthesize protocol (§4.H).
//!
//! The overall "collect proposals, rank, have the losers critique the
//! winner, synthesize" shape is grounded on a multi-agent debate loop seen
//! elsewhere in the reference corpus; the per-round prompt construction and
//! failure isolation rules are this system's own (§4.H), since that loop
//! has only two rounds and no verification step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::CoreError;
use crate::evaluator::Evaluator;
use crate::parallel_runner::ParallelInstanceRunner;
use crate::progress::{expert_event, phase_event, ProgressSink};
use crate::prompts::{review_prompt, truncate_with_marker};
use crate::registry::ExpertRegistry;
use crate::retry::RetryController;
use crate::selector::PlannedExpert;
use crate::types::{EvaluationDetail, ExpertStatus, Phase, Proposal, Ranking};
use crate::verify::{CrossVerifier, VerificationTrigger};
use crate::worker::ExpertWorker;

const IMPROVE_TRUNCATION_CHARS: usize = 3000;
const ENHANCEMENT_TRUNCATION_CHARS: usize = 2000;

pub struct DebateOutcome {
    pub experts_used: Vec<String>,
    pub proposals: HashMap<String, Proposal>,
    pub ranking: Ranking,
    pub improvements: HashMap<String, String>,
    pub verification: Option<crate::types::VerificationReport>,
    pub final_text: String,
}

pub struct DebateRunner {
    worker: Arc<dyn ExpertWorker>,
    retry: Arc<RetryController>,
    evaluator: Arc<dyn Evaluator>,
    verifier: Option<Arc<dyn CrossVerifier>>,
    semaphore: Arc<Semaphore>,
}

impl DebateRunner {
    pub fn new(
        worker: Arc<dyn ExpertWorker>,
        retry: Arc<RetryController>,
        evaluator: Arc<dyn Evaluator>,
        verifier: Option<Arc<dyn CrossVerifier>>,
        semaphore: Arc<Semaphore>,
    ) -> Self {
        Self {
            worker,
            retry,
            evaluator,
            verifier,
            semaphore,
        }
    }

    pub async fn run(
        &self,
        question: &str,
        workdir: &str,
        registry: &ExpertRegistry,
        plan: &[PlannedExpert],
        verification_trigger: VerificationTrigger,
        policy: &RetryPolicy,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
        ultrathink: bool,
    ) -> Result<DebateOutcome, CoreError> {
        let start = Instant::now();
        let runner = ParallelInstanceRunner::new(self.worker.clone(), self.retry.clone(), self.semaphore.clone());

        progress.emit(phase_event(Phase::Round1, 0.0, "round 1: independent propose", 0));

        let mut proposals: HashMap<String, Proposal> = HashMap::new();
        for (index, planned) in plan.iter().enumerate() {
            let descriptor = registry.get(&planned.expert_id)?;
            progress.emit(expert_event(
                Phase::Round1,
                0.0,
                &planned.expert_id,
                ExpertStatus::Starting,
                start.elapsed().as_millis() as u64,
            ));
            let proposal = runner
                .run(
                    descriptor,
                    planned.replica_count,
                    question,
                    workdir,
                    policy,
                    cancel.clone(),
                    ultrathink && index == 0,
                )
                .await;
            progress.emit(expert_event(
                Phase::Round1,
                0.0,
                &planned.expert_id,
                if proposal.is_usable() {
                    ExpertStatus::Completed
                } else {
                    ExpertStatus::Failed
                },
                start.elapsed().as_millis() as u64,
            ));
            proposals.insert(planned.expert_id.clone(), proposal);
        }

        let usable_count = proposals.values().filter(|p| p.is_usable()).count();
        if usable_count < 2 {
            return Err(CoreError::InsufficientExperts {
                attempted: proposals.len(),
                succeeded: usable_count,
            });
        }

        progress.emit(phase_event(
            Phase::Evaluating,
            30.0,
            "ranking proposals",
            start.elapsed().as_millis() as u64,
        ));

        let usable_texts: HashMap<String, String> = proposals
            .iter()
            .filter(|(_, p)| p.is_usable())
            .map(|(id, p)| (id.clone(), p.text.clone().unwrap()))
            .collect();

        let ranking = match self.evaluator.rank(question, &usable_texts).await {
            Ok(ranking) if ranking.is_consistent() => ranking,
            _ => fallback_ranking(&usable_texts),
        };

        let mut verification = None;
        if verification_trigger.should_verify() {
            if let Some(verifier) = &self.verifier {
                progress.emit(phase_event(
                    Phase::Verifying,
                    45.0,
                    "cross-verifying proposals",
                    start.elapsed().as_millis() as u64,
                ));
                verification = Some(verifier.verify(question, &proposals, &ranking.best_expert_id).await);
            }
        }

        progress.emit(phase_event(
            Phase::Round2,
            60.0,
            "round 2: review and improve",
            start.elapsed().as_millis() as u64,
        ));

        let best_text = usable_texts
            .get(&ranking.best_expert_id)
            .cloned()
            .unwrap_or_default();

        let mut improvements: HashMap<String, String> = HashMap::new();
        for (expert_id, _) in usable_texts.iter().filter(|(id, _)| **id != ranking.best_expert_id) {
            let descriptor = registry.get(expert_id)?;
            let prompt = review_prompt(descriptor, question, &best_text);
            progress.emit(expert_event(
                Phase::Round2,
                60.0,
                expert_id,
                ExpertStatus::Running,
                start.elapsed().as_millis() as u64,
            ));

            let _permit = self
                .semaphore
                .acquire()
                .await
                .expect("semaphore is never closed");
            let result = self
                .retry
                .execute(policy, {
                    let worker = self.worker.clone();
                    let expert_id = expert_id.clone();
                    let workdir = workdir.to_string();
                    let prompt = prompt.clone();
                    let cancel = cancel.clone();
                    move || {
                        let worker = worker.clone();
                        let expert_id = expert_id.clone();
                        let workdir = workdir.clone();
                        let prompt = prompt.clone();
                        let cancel = cancel.clone();
                        async move {
                            worker
                                .invoke(
                                    &expert_id,
                                    &prompt,
                                    &workdir,
                                    None,
                                    std::time::Duration::from_secs(120),
                                    cancel,
                                )
                                .await
                        }
                    }
                })
                .await;

            match result {
                Ok(text) => {
                    improvements.insert(expert_id.clone(), text);
                    progress.emit(expert_event(
                        Phase::Round2,
                        60.0,
                        expert_id,
                        ExpertStatus::Completed,
                        start.elapsed().as_millis() as u64,
                    ));
                }
                Err(_) => {
                    progress.emit(expert_event(
                        Phase::Round2,
                        60.0,
                        expert_id,
                        ExpertStatus::Failed,
                        start.elapsed().as_millis() as u64,
                    ));
                }
            }
        }

        progress.emit(phase_event(
            Phase::Synthesizing,
            85.0,
            "round 3: synthesize",
            start.elapsed().as_millis() as u64,
        ));

        let final_text = synthesize(
            &ranking,
            &best_text,
            &improvements,
            verification.as_ref(),
        );

        Ok(DebateOutcome {
            experts_used: plan.iter().map(|p| p.expert_id.clone()).collect(),
            proposals,
            ranking,
            improvements,
            verification,
            final_text,
        })
    }
}

/// Evaluator-failure fallback: pick the longest usable text, fixed score 50
/// for every candidate (§4.H "Ranking").
fn fallback_ranking(texts: &HashMap<String, String>) -> Ranking {
    let best_id = texts
        .iter()
        .max_by_key(|(_, text)| text.chars().count())
        .map(|(id, _)| id.clone())
        .unwrap_or_default();

    let per_expert = texts.keys().map(|id| (id.clone(), 50.0)).collect();
    let per_expert_detail = texts.keys().map(|id| (id.clone(), EvaluationDetail::default())).collect();

    Ranking {
        best_expert_id: best_id,
        per_expert,
        notes: Some("evaluator unavailable: fell back to longest-text heuristic".to_string()),
        per_expert_detail,
        is_fallback: true,
    }
}

/// Builds the Round 3 structured markdown (§4.H "Round 3 — Synthesize").
fn synthesize(
    ranking: &Ranking,
    best_text: &str,
    improvements: &HashMap<String, String>,
    verification: Option<&crate::types::VerificationReport>,
) -> String {
    let mut out = String::new();

    let best_score = ranking.per_expert.get(&ranking.best_expert_id).copied().unwrap_or(0.0);
    out.push_str(&format!(
        "# Consensus answer (led by {}, score {:.0})\n\n",
        ranking.best_expert_id, best_score
    ));

    if let Some(report) = verification {
        out.push_str("## Verification\n");
        out.push_str(&format!(
            "Overall confidence: {:.2}. Security verified: {}.\n\n",
            report.overall_confidence, report.security_verified_overall
        ));
    }

    out.push_str("## Solution\n");
    out.push_str(best_text);
    out.push_str("\n\n");

    if !improvements.is_empty() {
        out.push_str("## Enhancements from other experts\n");
        let mut ids: Vec<&String> = improvements.keys().collect();
        ids.sort();
        for id in ids {
            let text = &improvements[id];
            out.push_str(&format!(
                "### {id}\n{}\n\n",
                truncate_with_marker(text, ENHANCEMENT_TRUNCATION_CHARS)
            ));
        }
    }

    if !ranking.per_expert_detail.is_empty() {
        out.push_str("## Evaluation\n| Expert | Score | Strengths | Weaknesses |\n|---|---|---|---|\n");
        let mut ids: Vec<&String> = ranking.per_expert.keys().collect();
        ids.sort();
        for id in ids {
            let score = ranking.per_expert.get(id).copied().unwrap_or(0.0);
            let empty = EvaluationDetail::default();
            let detail = ranking.per_expert_detail.get(id).unwrap_or(&empty);
            out.push_str(&format!(
                "| {id} | {:.0} | {} | {} |\n",
                score,
                detail.strengths.join("; "),
                detail.weaknesses.join("; ")
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_ranking_picks_longest_text() {
        let mut texts = HashMap::new();
        texts.insert("a".to_string(), "short".to_string());
        texts.insert("b".to_string(), "a much longer answer here".to_string());
        let ranking = fallback_ranking(&texts);
        assert_eq!(ranking.best_expert_id, "b");
        assert!(ranking.is_fallback);
        assert_eq!(ranking.per_expert["b"], 50.0);
    }

    #[test]
    fn synthesize_orders_sections() {
        let ranking = Ranking {
            best_expert_id: "a".to_string(),
            per_expert: [("a".to_string(), 90.0)].into_iter().collect(),
            notes: None,
            per_expert_detail: HashMap::new(),
            is_fallback: false,
        };
        let improvements = [("b".to_string(), "do X better".to_string())].into_iter().collect();
        let text = synthesize(&ranking, "core answer", &improvements, None);
        let solution_pos = text.find("## Solution").unwrap();
        let enhancements_pos = text.find("## Enhancements").unwrap();
        assert!(solution_pos < enhancements_pos);
        assert!(text.contains("core answer"));
    }
}
