//! CrossVerifier — fact-check, code-pattern and adversarial verification
//! layers run over Round 1 proposals (§4.I).
//!
//! The static code-pattern layer is grounded on the kind of linting a code
//! reviewer would do by eye — no real parser, just the same substring/regex
//! heuristics the teacher's codebase favors for quick static checks, applied
//! here to content pulled out of fenced Markdown blocks instead of a real
//! source file.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::prompts::{adversarial_prompt, fact_check_prompt};
use crate::registry::ExpertRegistry;
use crate::retry::RetryController;
use crate::types::{Proposal, ProposalVerification, VerificationReport};
use crate::worker::ExpertWorker;

const CRITICAL_KEYWORDS: &[&str] = &[
    "security", "auth", "password", "token", "encrypt", "compliance", "gdpr", "hipaa", "audit",
    "vulnerability",
];
const ALWAYS_VERIFY_CATEGORIES: &[&str] =
    &["security", "financial", "production", "data-migration", "compliance"];

/// Decides whether §4.I's trigger conditions are met.
///
/// `force_verification` is the caller's explicit override and always wins;
/// `skip_verification` only suppresses the content-driven trigger, never an
/// explicit force.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationTrigger {
    pub force_verification: bool,
    pub skip_verification: bool,
    pub content_requires_verification: bool,
}

impl VerificationTrigger {
    pub fn from_context(question: &str, category: &str, force: bool, skip: bool) -> Self {
        let lower = question.to_lowercase();
        let keyword_hit = CRITICAL_KEYWORDS.iter().any(|kw| lower.contains(kw));
        let category_hit = ALWAYS_VERIFY_CATEGORIES.contains(&category);
        Self {
            force_verification: force,
            skip_verification: skip,
            content_requires_verification: keyword_hit || category_hit,
        }
    }

    pub fn should_verify(&self) -> bool {
        self.force_verification || (self.content_requires_verification && !self.skip_verification)
    }
}

#[async_trait]
pub trait CrossVerifier: Send + Sync {
    async fn verify(
        &self,
        question: &str,
        proposals: &HashMap<String, Proposal>,
        best_expert_id: &str,
    ) -> VerificationReport;
}

#[derive(Debug, Deserialize)]
struct FactCheckResponse {
    #[serde(default)]
    accuracy: f64,
    #[serde(default)]
    security: f64,
    #[serde(default)]
    logic: f64,
    #[serde(default)]
    completeness: f64,
    #[serde(default = "default_one")]
    best_practice: f64,
    #[serde(default)]
    warnings: Vec<String>,
}

fn default_one() -> f64 {
    1.0
}

struct Challenge {
    name: &'static str,
    is_security: bool,
}

const CHALLENGE_CATALOGUE: &[Challenge] = &[
    Challenge { name: "security hunt", is_security: true },
    Challenge { name: "edge-case discovery", is_security: false },
    Challenge { name: "performance stress", is_security: false },
    Challenge { name: "logic errors", is_security: false },
    Challenge { name: "integration failure points", is_security: false },
];

pub struct LlmCrossVerifier {
    worker: Arc<dyn ExpertWorker>,
    retry: Arc<RetryController>,
    registry: Arc<ExpertRegistry>,
    policy: RetryPolicy,
}

impl LlmCrossVerifier {
    pub fn new(
        worker: Arc<dyn ExpertWorker>,
        retry: Arc<RetryController>,
        registry: Arc<ExpertRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            worker,
            retry,
            registry,
            policy,
        }
    }

    fn other_experts(&self, author_id: &str, limit: usize) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .get_all()
            .map(|d| d.id.clone())
            .filter(|id| id != author_id)
            .collect();
        ids.sort();
        ids.truncate(limit);
        ids
    }

    async fn invoke(&self, expert_id: &str, prompt: &str) -> Option<String> {
        self.retry
            .execute(&self.policy, {
                let worker = self.worker.clone();
                let expert_id = expert_id.to_string();
                let prompt = prompt.to_string();
                move || {
                    let worker = worker.clone();
                    let expert_id = expert_id.clone();
                    let prompt = prompt.clone();
                    async move {
                        worker
                            .invoke(&expert_id, &prompt, ".", None, Duration::from_secs(60), CancellationToken::new())
                            .await
                    }
                }
            })
            .await
            .ok()
    }

    async fn fact_check(&self, question: &str, author_id: &str, text: &str) -> (f64, Vec<String>) {
        let reviewers = self.other_experts(author_id, 3);
        if reviewers.is_empty() {
            return (0.5, Vec::new());
        }

        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut warnings = Vec::new();

        for reviewer in &reviewers {
            let descriptor = match self.registry.get(reviewer) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let prompt = fact_check_prompt(descriptor, question, text);
            let Some(raw) = self.invoke(reviewer, &prompt).await else {
                continue;
            };
            let Ok(parsed) = serde_json::from_str::<FactCheckResponse>(&raw) else {
                continue;
            };
            let score = (parsed.accuracy + parsed.security + parsed.logic + parsed.completeness + parsed.best_practice)
                / 5.0;
            let score = score.clamp(0.0, 1.0);
            weighted_sum += score * score;
            weight_total += score;
            warnings.extend(parsed.warnings);
        }

        let fact_accuracy = if weight_total > 0.0 {
            weighted_sum / weight_total
        } else {
            0.5
        };
        (fact_accuracy, warnings)
    }

    async fn adversarial(&self, text: &str, author_id: &str) -> (u32, u32, bool) {
        let mut passed = 0;
        let mut security_verified = true;
        let reviewers = self.other_experts(author_id, CHALLENGE_CATALOGUE.len());

        for (i, challenge) in CHALLENGE_CATALOGUE.iter().enumerate() {
            let Some(reviewer_id) = reviewers.get(i % reviewers.len().max(1)) else {
                continue;
            };
            let Ok(descriptor) = self.registry.get(reviewer_id) else {
                continue;
            };
            let prompt = adversarial_prompt(descriptor, challenge.name, text);
            let response = self.invoke(reviewer_id, &prompt).await.unwrap_or_default();
            let no_issues = response.to_lowercase().contains("no issues");
            if no_issues {
                passed += 1;
            } else if challenge.is_security {
                security_verified = false;
            }
        }

        (passed, CHALLENGE_CATALOGUE.len() as u32, security_verified)
    }
}

#[async_trait]
impl CrossVerifier for LlmCrossVerifier {
    async fn verify(
        &self,
        question: &str,
        proposals: &HashMap<String, Proposal>,
        _best_expert_id: &str,
    ) -> VerificationReport {
        let mut per_proposal = HashMap::new();

        for (expert_id, proposal) in proposals.iter().filter(|(_, p)| p.is_usable()) {
            let text = proposal.text.as_deref().unwrap_or_default();

            let (fact_accuracy, fact_warnings) = self.fact_check(question, expert_id, text).await;
            let code_correctness = code_correctness_score(text);
            let (challenges_passed, total_challenges, security_verified) =
                self.adversarial(text, expert_id).await;

            let confidence = composite_confidence(
                fact_accuracy,
                code_correctness,
                security_verified,
                challenges_passed,
                fact_warnings.len(),
            );

            per_proposal.insert(
                expert_id.clone(),
                ProposalVerification {
                    fact_accuracy,
                    code_correctness,
                    security_verified,
                    challenges_passed,
                    total_challenges,
                    confidence,
                    warnings: fact_warnings,
                },
            );
        }

        let overall_confidence = if per_proposal.is_empty() {
            0.0
        } else {
            per_proposal.values().map(|v| v.confidence).sum::<f64>() / per_proposal.len() as f64
        };
        let security_verified_overall = per_proposal.values().all(|v| v.security_verified);

        VerificationReport {
            enabled: true,
            per_proposal,
            overall_confidence,
            security_verified_overall,
        }
    }
}

/// Composite per-proposal confidence formula (§4.I).
pub fn composite_confidence(
    fact_accuracy: f64,
    code_correctness: f64,
    security_verified: bool,
    challenges_passed: u32,
    warning_count: usize,
) -> f64 {
    let security_term = if security_verified { 1.0 } else { 0.5 };
    let challenge_term = (challenges_passed as f64 / 5.0).min(1.0);
    let raw = 0.4 * fact_accuracy + 0.3 * code_correctness + 0.2 * security_term + 0.1 * challenge_term;
    let penalty = (0.05 * warning_count as f64).min(0.3);
    (raw - penalty).max(0.1)
}

/// Extracts fenced code blocks (```...```) from Markdown text.
fn extract_code_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut lines = text.lines().peekable();
    let mut current: Option<Vec<&str>> = None;

    while let Some(line) = lines.next() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(buf) => blocks.push(buf.join("\n")),
                None => current = Some(Vec::new()),
            }
        } else if let Some(buf) = current.as_mut() {
            buf.push(line);
        }
    }
    blocks
}

/// Static pattern check over fenced code blocks (§4.I layer 2). Each issue
/// multiplicatively downgrades the starting score of 1.0.
fn code_correctness_score(text: &str) -> f64 {
    let blocks = extract_code_blocks(text);
    if blocks.is_empty() {
        return 1.0;
    }

    let mut score = 1.0_f64;
    for block in &blocks {
        for (detector, severity) in code_pattern_checks() {
            if detector(block) {
                score *= severity;
            }
        }
    }
    score.max(0.1)
}

type Detector = fn(&str) -> bool;

fn unbalanced_braces(code: &str) -> bool {
    let open = code.matches('{').count();
    let close = code.matches('}').count();
    open != close
}

fn uses_eval_like(code: &str) -> bool {
    ["eval(", "Function(", "exec("].iter().any(|p| code.contains(p))
}

fn unsanitized_html(code: &str) -> bool {
    ["innerHTML =", "dangerouslySetInnerHTML"].iter().any(|p| code.contains(p))
}

fn logs_credentials(code: &str) -> bool {
    let lower = code.to_lowercase();
    ["console.log(password", "println!(\"{}\", env", "log.info(token", "print(api_key"]
        .iter()
        .any(|p| lower.contains(&p.to_lowercase()))
}

fn sequential_async_in_loop(code: &str) -> bool {
    code.contains("for ") && code.contains(".await") && !code.contains("join_all") && !code.contains("JoinSet")
}

fn code_pattern_checks() -> Vec<(Detector, f64)> {
    vec![
        (unbalanced_braces as Detector, 0.7),
        (uses_eval_like as Detector, 0.7),
        (unsanitized_html as Detector, 0.8),
        (logs_credentials as Detector, 0.7),
        (sequential_async_in_loop as Detector, 0.9),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_fires_on_critical_keyword() {
        let trigger = VerificationTrigger::from_context("how do I store passwords safely?", "general/analysis", false, false);
        assert!(trigger.should_verify());
    }

    #[test]
    fn trigger_fires_on_always_verify_category() {
        let trigger = VerificationTrigger::from_context("anything", "production", false, false);
        assert!(trigger.should_verify());
    }

    #[test]
    fn force_overrides_skip() {
        let trigger = VerificationTrigger::from_context("anything", "general/analysis", true, true);
        assert!(trigger.should_verify());
    }

    #[test]
    fn skip_suppresses_content_driven_trigger() {
        let trigger = VerificationTrigger::from_context("anything", "security", false, true);
        assert!(!trigger.should_verify());
    }

    #[test]
    fn clean_code_scores_full() {
        let text = "```rust\nfn add(a: i32, b: i32) -> i32 { a + b }\n```";
        assert_eq!(code_correctness_score(text), 1.0);
    }

    #[test]
    fn unbalanced_braces_downgrades() {
        let text = "```js\nfunction f() { return 1;\n```";
        assert!(code_correctness_score(text) < 1.0);
    }

    #[test]
    fn no_code_blocks_scores_full() {
        assert_eq!(code_correctness_score("just prose, no code"), 1.0);
    }

    #[test]
    fn composite_confidence_formula_clamped() {
        let c = composite_confidence(0.0, 0.0, false, 0, 10);
        assert_eq!(c, 0.1);
        let c = composite_confidence(1.0, 1.0, true, 5, 0);
        assert!((c - 1.0).abs() < 1e-9);
    }
}
