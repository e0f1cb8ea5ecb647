//! Stable prompt templates (§6 "Prompts sent to ExpertWorker").
//!
//! Every outbound prompt begins with a fixed header identifying the expert's
//! display name and role, grounded on the teacher's `round1_prompt`/
//! `critique_prompt` builders in spirit (a fixed header plus a templated
//! body), generalized from a fixed two-round bee-colony shape to the five
//! prompt kinds this protocol needs.

use crate::types::{ExpertDescriptor, ExpertInstanceSpec};

const REVIEW_TRUNCATION_CHARS: usize = 3000;
const SYNTHESIS_TRUNCATION_CHARS: usize = 2000;

/// Truncate to `limit` Unicode code points, appending the truncation marker
/// "…" when truncation actually occurred (§6).
pub fn truncate_with_marker(text: &str, limit: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{truncated}…")
}

fn header(expert: &ExpertDescriptor) -> String {
    format!(
        "You are {} ({}). Expertise: {}.",
        expert.display_name, expert.role_tag, expert.expertise
    )
}

fn instance_context_block(spec: Option<&ExpertInstanceSpec>) -> String {
    match spec {
        Some(s) if s.instructions_text.is_some() => format!(
            "\n## Instance context\nfocus: {}\ntemperature: {:.2}\ninstance {} of {}\n{}\n",
            s.focus_label.as_str(),
            s.temperature,
            s.instance_index,
            s.replica_count,
            s.instructions_text.as_deref().unwrap_or_default()
        ),
        _ => String::new(),
    }
}

/// Round 1 propose prompt.
pub fn propose_prompt(
    expert: &ExpertDescriptor,
    question: &str,
    workdir: &str,
    instance_spec: Option<&ExpertInstanceSpec>,
    ultrathink: bool,
) -> String {
    let marker = if ultrathink { "ultrathink\n\n" } else { "" };
    format!(
        "{marker}{header}\n\n## Question\n{question}\n\n## Working directory\n{workdir}\n{instance}\n## Instructions\n\
- Understand the project context before answering.\n\
- Read relevant files in the working directory if applicable.\n\
- Run commands to verify your understanding if applicable.\n\
- Provide a concrete, actionable solution.\n",
        marker = marker,
        header = header(expert),
        question = question,
        workdir = workdir,
        instance = instance_context_block(instance_spec),
    )
}

/// Synthesis prompt sent back to the same expert when ≥2 replicas succeeded
/// (§4.F). Each replica's output is truncated to ≤2000 code points.
pub fn synthesis_prompt(expert: &ExpertDescriptor, question: &str, replica_texts: &[String]) -> String {
    let summaries: String = replica_texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            format!(
                "### Instance {}\n{}",
                i + 1,
                truncate_with_marker(text, SYNTHESIS_TRUNCATION_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{header}\n\n## Question\n{question}\n\n## Your own parallel instances produced these answers\n{summaries}\n\n\
## Instructions\nSynthesize a single best answer combining the strongest points of each instance above.\n",
        header = header(expert),
        question = question,
        summaries = summaries,
    )
}

/// Round 2 "review and improve" prompt (§4.H).
pub fn review_prompt(expert: &ExpertDescriptor, question: &str, best_proposal: &str) -> String {
    format!(
        "{header}\n\n## Question\n{question}\n\n## Leading proposal (from another expert)\n{best}\n\n\
## Instructions\nReview and improve this proposal. Do not rewrite it from scratch; add what's missing or point out what's wrong.\n",
        header = header(expert),
        question = question,
        best = truncate_with_marker(best_proposal, REVIEW_TRUNCATION_CHARS),
    )
}

/// Fact-check verification prompt (§4.I layer 1).
pub fn fact_check_prompt(expert: &ExpertDescriptor, question: &str, proposal: &str) -> String {
    format!(
        "{header}\n\n## Question\n{question}\n\n## Answer to verify\n{proposal}\n\n\
## Instructions\nAssess this answer's accuracy, security, logic, completeness and adherence to best practices.\n\
Respond as JSON: {{\"accuracy\": 0-1, \"security\": 0-1, \"logic\": 0-1, \"completeness\": 0-1, \"best_practice\": 0-1, \"warnings\": [\"...\"]}}\n",
        header = header(expert),
        question = question,
        proposal = proposal,
    )
}

/// Adversarial challenge prompt (§4.I layer 3).
pub fn adversarial_prompt(expert: &ExpertDescriptor, challenge_name: &str, proposal: &str) -> String {
    format!(
        "{header}\n\n## Challenge: {challenge}\n\n## Answer under test\n{proposal}\n\n\
## Instructions\nTry to break this answer from the '{challenge}' angle. Report issues found, or \"no issues\" if none.\n",
        header = header(expert),
        challenge = challenge_name,
        proposal = proposal,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expert() -> ExpertDescriptor {
        ExpertDescriptor {
            id: "claude".to_string(),
            display_name: "Claude".to_string(),
            role_tag: "generalist".to_string(),
            expertise: "code review".to_string(),
            relative_cost: 1.0,
            relative_speed: 3,
            specialties: vec![],
        }
    }

    #[test]
    fn truncation_adds_marker_only_when_needed() {
        let short = "hello";
        assert_eq!(truncate_with_marker(short, 10), "hello");
        let long = "a".repeat(20);
        let truncated = truncate_with_marker(&long, 10);
        assert_eq!(truncated.chars().count(), 11);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn review_prompt_truncates_at_3000() {
        let long = "x".repeat(5000);
        let prompt = review_prompt(&expert(), "q", &long);
        assert!(prompt.contains('…'));
    }

    #[test]
    fn ultrathink_marker_prepended() {
        let prompt = propose_prompt(&expert(), "q", "/tmp", None, true);
        assert!(prompt.starts_with("ultrathink"));
    }
}
