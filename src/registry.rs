//! ExpertRegistry — static catalog of expert descriptors (§4.A).
//!
//! Grounded on the teacher's `Thinker` catalog (`types.rs`/`db.rs`'s `thinkers`
//! table): there, thinkers are persisted rows loaded at startup; here the
//! registry is compiled in, since the spec requires the id set to be fixed at
//! startup, not imported at runtime (the teacher's `bin/import.rs` CLI has no
//! counterpart here).

use std::collections::HashMap;

use crate::error::CoreError;
use crate::types::ExpertDescriptor;

/// Read-only map `expertId -> ExpertDescriptor`, built once at startup.
#[derive(Debug, Clone)]
pub struct ExpertRegistry {
    experts: HashMap<String, ExpertDescriptor>,
    /// Category -> ordered shortlist of expert ids, consulted by the
    /// Selector's FallbackHeuristic (§4.G) when no Analyzer is available.
    category_shortlists: HashMap<String, Vec<String>>,
}

impl ExpertRegistry {
    pub fn new(experts: Vec<ExpertDescriptor>) -> Self {
        let experts = experts.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self {
            experts,
            category_shortlists: HashMap::new(),
        }
    }

    pub fn with_category_shortlists(
        mut self,
        shortlists: HashMap<String, Vec<String>>,
    ) -> Self {
        self.category_shortlists = shortlists;
        self
    }

    pub fn get(&self, id: &str) -> Result<&ExpertDescriptor, CoreError> {
        self.experts
            .get(id)
            .ok_or_else(|| CoreError::UnknownExpert(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.experts.contains_key(id)
    }

    pub fn get_all(&self) -> impl Iterator<Item = &ExpertDescriptor> {
        self.experts.values()
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }

    /// Default shortlist for a category, falling back to every registered
    /// expert id (stably ordered) if the category has no curated list.
    pub fn shortlist_for_category(&self, category: &str) -> Vec<String> {
        if let Some(list) = self.category_shortlists.get(category) {
            return list.clone();
        }
        let mut ids: Vec<String> = self.experts.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// A small, representative built-in catalog matching the category taxonomy
/// used by [`crate::selector::FallbackHeuristic`]. Hosts are expected to
/// supply their own catalog in production; this is the default used by the
/// demo binary and by tests.
pub fn default_registry() -> ExpertRegistry {
    let experts = vec![
        ExpertDescriptor {
            id: "claude".to_string(),
            display_name: "Claude".to_string(),
            role_tag: "generalist".to_string(),
            expertise: "broad reasoning, code review, security analysis".to_string(),
            relative_cost: 3.0,
            relative_speed: 3,
            specialties: vec![
                "security".to_string(),
                "architecture".to_string(),
                "general/analysis".to_string(),
            ],
        },
        ExpertDescriptor {
            id: "gpt".to_string(),
            display_name: "GPT".to_string(),
            role_tag: "generalist".to_string(),
            expertise: "broad reasoning, planning, deep reasoning on novel problems".to_string(),
            relative_cost: 3.0,
            relative_speed: 3,
            specialties: vec![
                "deep reasoning".to_string(),
                "architecture".to_string(),
                "general/analysis".to_string(),
            ],
        },
        ExpertDescriptor {
            id: "gemini".to_string(),
            display_name: "Gemini".to_string(),
            role_tag: "generalist".to_string(),
            expertise: "fast iteration, large context synthesis".to_string(),
            relative_cost: 1.0,
            relative_speed: 5,
            specialties: vec!["performance".to_string(), "general/analysis".to_string()],
        },
        ExpertDescriptor {
            id: "llama".to_string(),
            display_name: "Llama".to_string(),
            role_tag: "local".to_string(),
            expertise: "free, local inference, quick sanity checks".to_string(),
            relative_cost: 0.0,
            relative_speed: 4,
            specialties: vec!["general/analysis".to_string()],
        },
        ExpertDescriptor {
            id: "deepseek".to_string(),
            display_name: "DeepSeek".to_string(),
            role_tag: "specialist".to_string(),
            expertise: "algorithmic and mathematical deep reasoning".to_string(),
            relative_cost: 1.0,
            relative_speed: 3,
            specialties: vec!["deep reasoning".to_string(), "performance".to_string()],
        },
        ExpertDescriptor {
            id: "mistral".to_string(),
            display_name: "Mistral".to_string(),
            role_tag: "generalist".to_string(),
            expertise: "production engineering, data migration safety".to_string(),
            relative_cost: 1.5,
            relative_speed: 4,
            specialties: vec![
                "production".to_string(),
                "data-migration".to_string(),
                "compliance".to_string(),
            ],
        },
    ];

    let mut shortlists: HashMap<String, Vec<String>> = HashMap::new();
    shortlists.insert(
        "security".to_string(),
        vec!["claude".to_string(), "gpt".to_string(), "mistral".to_string()],
    );
    shortlists.insert(
        "performance".to_string(),
        vec!["gemini".to_string(), "deepseek".to_string(), "gpt".to_string()],
    );
    shortlists.insert(
        "architecture".to_string(),
        vec!["gpt".to_string(), "claude".to_string(), "mistral".to_string()],
    );
    shortlists.insert(
        "general/analysis".to_string(),
        vec![
            "claude".to_string(),
            "gpt".to_string(),
            "gemini".to_string(),
            "llama".to_string(),
        ],
    );
    shortlists.insert(
        "production".to_string(),
        vec!["mistral".to_string(), "claude".to_string(), "gpt".to_string()],
    );
    shortlists.insert(
        "data-migration".to_string(),
        vec!["mistral".to_string(), "claude".to_string()],
    );
    shortlists.insert(
        "compliance".to_string(),
        vec!["mistral".to_string(), "claude".to_string()],
    );

    ExpertRegistry::new(experts).with_category_shortlists(shortlists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_errors() {
        let reg = default_registry();
        assert!(matches!(
            reg.get("nonexistent"),
            Err(CoreError::UnknownExpert(_))
        ));
    }

    #[test]
    fn known_id_resolves() {
        let reg = default_registry();
        assert_eq!(reg.get("claude").unwrap().id, "claude");
    }

    #[test]
    fn shortlist_fallback_returns_all_ids_sorted() {
        let reg = default_registry();
        let shortlist = reg.shortlist_for_category("never-heard-of-this-category");
        let mut sorted: Vec<String> = shortlist.clone();
        sorted.sort();
        assert_eq!(shortlist, sorted);
        assert_eq!(shortlist.len(), reg.len());
    }
}
