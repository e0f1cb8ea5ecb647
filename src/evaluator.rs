//! Evaluator and Analyzer — collaborator interfaces consumed by the core
//! (§4.D, and the "Analyzed" branch of §4.G).
//!
//! `LlmEvaluator`/`LlmAnalyzer` are concrete, LLM-backed implementations
//! grounded on the teacher's `eval::llm_judge` module: same rubric-driven
//! prompt construction and score-line parsing against a real
//! `reqwest::Client` call, adapted from judging a single decision's quality
//! to ranking N expert proposals against each other / classifying a question.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{AnalysisSource, EvaluationDetail, QuestionAnalysis, Ranking};

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("evaluator backend error: {0}")]
    Backend(String),
    #[error("evaluator returned unparseable output")]
    Unparseable,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analyzer backend error: {0}")]
    Backend(String),
    #[error("analyzer returned unparseable output")]
    Unparseable,
}

/// `rank(question, {expertId -> proposalText}) -> Ranking`.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn rank(
        &self,
        question: &str,
        proposals: &HashMap<String, String>,
    ) -> Result<Ranking, EvaluatorError>;
}

/// Classifies a question into category/complexity/criticality/urgency.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, question: &str) -> Result<QuestionAnalysis, AnalyzerError>;
}

/// Rubric criterion used by [`LlmEvaluator`], mirroring the teacher's
/// `JudgeCriterion` (name, description, weight, 1-5 scale descriptions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingCriterion {
    pub name: String,
    pub description: String,
    pub weight: f64,
}

fn default_rubric() -> Vec<RankingCriterion> {
    vec![
        RankingCriterion {
            name: "correctness".to_string(),
            description: "Is the proposal technically correct and complete?".to_string(),
            weight: 0.4,
        },
        RankingCriterion {
            name: "actionability".to_string(),
            description: "Can the reader act on this immediately?".to_string(),
            weight: 0.3,
        },
        RankingCriterion {
            name: "clarity".to_string(),
            description: "Is the reasoning easy to follow and well organized?".to_string(),
            weight: 0.3,
        },
    ]
}

/// LLM-backed Evaluator, grounded on `eval::llm_judge::JudgeConfig`.
pub struct LlmEvaluator {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub rubric: Vec<RankingCriterion>,
    client: reqwest::Client,
}

impl LlmEvaluator {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            rubric: default_rubric(),
            client: reqwest::Client::new(),
        }
    }

    fn build_prompt(&self, question: &str, proposals: &HashMap<String, String>) -> String {
        let criteria_text: String = self
            .rubric
            .iter()
            .map(|c| format!("- {} (weight {:.2}): {}", c.name, c.weight, c.description))
            .collect::<Vec<_>>()
            .join("\n");

        let proposals_text: String = proposals
            .iter()
            .map(|(id, text)| format!("### Proposal from {id}\n{text}"))
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            r#"You are ranking competing answers to a question from several independent experts.

## Question
{question}

## Proposals
{proposals_text}

## Criteria
{criteria_text}

## Instructions
Score every proposal from 0-100 and pick the single best one.

Respond in this exact format, one block per expert id:

EXPERT: <id>
SCORE: <0-100>
STRENGTHS:
- ...
WEAKNESSES:
- ...

BEST: <id>
"#
        )
    }

    async fn call_model(&self, prompt: &str) -> Result<String, EvaluatorError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 2048,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(60))
            .json(&body)
            .send()
            .await
            .map_err(|e| EvaluatorError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EvaluatorError::Backend(text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EvaluatorError::Backend(e.to_string()))?;

        json["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or(EvaluatorError::Unparseable)
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn rank(
        &self,
        question: &str,
        proposals: &HashMap<String, String>,
    ) -> Result<Ranking, EvaluatorError> {
        if proposals.is_empty() {
            return Err(EvaluatorError::Unparseable);
        }
        let prompt = self.build_prompt(question, proposals);
        let content = self.call_model(&prompt).await?;
        parse_ranking(&content, proposals.keys())
    }
}

fn parse_ranking<'a>(
    content: &str,
    known_ids: impl Iterator<Item = &'a String>,
) -> Result<Ranking, EvaluatorError> {
    let known: std::collections::HashSet<&str> = known_ids.map(|s| s.as_str()).collect();
    let mut per_expert: HashMap<String, f64> = HashMap::new();
    let mut per_expert_detail: HashMap<String, EvaluationDetail> = HashMap::new();

    let mut current_id: Option<String> = None;
    let mut mode: Option<&str> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(id) = trimmed.strip_prefix("EXPERT:") {
            current_id = Some(id.trim().to_string());
            mode = None;
            per_expert_detail
                .entry(current_id.clone().unwrap())
                .or_default();
            continue;
        }
        if let Some(score_str) = trimmed.strip_prefix("SCORE:") {
            if let (Some(id), Ok(score)) = (&current_id, score_str.trim().parse::<f64>()) {
                per_expert.insert(id.clone(), score.clamp(0.0, 100.0));
            }
            continue;
        }
        if trimmed.starts_with("STRENGTHS:") {
            mode = Some("strengths");
            continue;
        }
        if trimmed.starts_with("WEAKNESSES:") {
            mode = Some("weaknesses");
            continue;
        }
        if let Some(item) = trimmed.strip_prefix('-') {
            if let Some(id) = &current_id {
                let entry = per_expert_detail.entry(id.clone()).or_default();
                match mode {
                    Some("strengths") => entry.strengths.push(item.trim().to_string()),
                    Some("weaknesses") => entry.weaknesses.push(item.trim().to_string()),
                    _ => {}
                }
            }
            continue;
        }
        if let Some(best) = trimmed.strip_prefix("BEST:") {
            let best_id = best.trim().to_string();
            if known.contains(best_id.as_str()) && per_expert.contains_key(&best_id) {
                return Ok(Ranking {
                    best_expert_id: best_id,
                    per_expert,
                    notes: None,
                    per_expert_detail,
                    is_fallback: false,
                });
            }
        }
    }

    // No explicit BEST line parsed successfully: fall back to highest score among parsed.
    let best_id = per_expert
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(id, _)| id.clone())
        .ok_or(EvaluatorError::Unparseable)?;

    Ok(Ranking {
        best_expert_id: best_id,
        per_expert,
        notes: None,
        per_expert_detail,
        is_fallback: false,
    })
}

/// LLM-backed Analyzer, same backend shape as [`LlmEvaluator`] but classifying
/// a single question rather than ranking proposals.
pub struct LlmAnalyzer {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl LlmAnalyzer {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    category: String,
    complexity: f64,
    criticality: f64,
    urgency: f64,
    #[serde(default)]
    context_clues: Vec<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.7
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(&self, question: &str) -> Result<QuestionAnalysis, AnalyzerError> {
        let prompt = format!(
            r#"Classify this question as JSON with keys category, complexity (0-1),
criticality (0-1), urgency (0-1), context_clues (array of short tags),
reasoning (one sentence), confidence (0-1).

Question: {question}

Respond with JSON only."#
        );

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 512,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyzerError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AnalyzerError::Backend(response.status().to_string()));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Backend(e.to_string()))?;

        let text = json["content"][0]["text"]
            .as_str()
            .ok_or(AnalyzerError::Unparseable)?;

        let raw: RawAnalysis =
            serde_json::from_str(text).map_err(|_| AnalyzerError::Unparseable)?;

        Ok(QuestionAnalysis {
            category: raw.category,
            complexity: Some(raw.complexity.clamp(0.0, 1.0)),
            criticality: Some(raw.criticality.clamp(0.0, 1.0)),
            urgency: Some(raw.urgency.clamp(0.0, 1.0)),
            context_clues: raw.context_clues,
            reasoning_text: Some(raw.reasoning),
            confidence_of_analysis: Some(raw.confidence.clamp(0.0, 1.0)),
            source: AnalysisSource::Analyzer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ranking_picks_explicit_best() {
        let content = r#"
EXPERT: alpha
SCORE: 70
STRENGTHS:
- clear
WEAKNESSES:
- slow

EXPERT: beta
SCORE: 90
STRENGTHS:
- correct
WEAKNESSES:
- none

BEST: beta
"#;
        let ids = vec!["alpha".to_string(), "beta".to_string()];
        let ranking = parse_ranking(content, ids.iter()).unwrap();
        assert_eq!(ranking.best_expert_id, "beta");
        assert_eq!(ranking.per_expert["beta"], 90.0);
        assert!(ranking.is_consistent());
    }

    #[test]
    fn parse_ranking_falls_back_to_max_score_without_best_line() {
        let content = "EXPERT: alpha\nSCORE: 55\nEXPERT: beta\nSCORE: 61\n";
        let ids = vec!["alpha".to_string(), "beta".to_string()];
        let ranking = parse_ranking(content, ids.iter()).unwrap();
        assert_eq!(ranking.best_expert_id, "beta");
    }

    #[test]
    fn default_rubric_weights_sum_to_one() {
        let total: f64 = default_rubric().iter().map(|c| c.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
