//! InstanceConfigBuilder — derives per-replica seed/temperature/focus (§4.E).

use crate::types::{ExpertInstanceSpec, FocusLabel};

const TEMPERATURE_FLOOR: f64 = 0.3;
const TEMPERATURE_STEP: f64 = 0.15;
const TEMPERATURE_CAP: f64 = 0.9;

fn focus_for_index(index: u32) -> FocusLabel {
    match index {
        1 => FocusLabel::Conservative,
        2 => FocusLabel::Innovative,
        3 => FocusLabel::Optimizing,
        k => FocusLabel::Alternative(k - 3),
    }
}

fn instructions_for_focus(focus: FocusLabel) -> String {
    match focus {
        FocusLabel::Conservative => {
            "Favor the safest, most battle-tested approach. Prefer established patterns over novel ones.".to_string()
        }
        FocusLabel::Innovative => {
            "Favor a creative, less conventional approach. Explore alternatives a conservative answer would skip.".to_string()
        }
        FocusLabel::Optimizing => {
            "Favor the approach with the best performance/efficiency characteristics.".to_string()
        }
        FocusLabel::Alternative(k) => {
            format!("Provide a genuinely distinct alternative (variant {k}) from a conservative baseline.")
        }
        FocusLabel::General | FocusLabel::Synthesizer => String::new(),
    }
}

/// Builds the `replicaCount` instance specs for one expert in one debate run.
pub fn build_instance_specs(expert_id: &str, replica_count: u32) -> Vec<ExpertInstanceSpec> {
    if replica_count <= 1 {
        // R=1 must be bit-for-bit the legacy single-invocation path: no
        // instructions text, focus "general".
        return vec![ExpertInstanceSpec {
            expert_id: expert_id.to_string(),
            instance_index: 1,
            replica_count: 1,
            seed: 1000,
            temperature: TEMPERATURE_FLOOR,
            focus_label: FocusLabel::General,
            instructions_text: None,
        }];
    }

    (1..=replica_count)
        .map(|i| {
            let temperature =
                (TEMPERATURE_FLOOR + (i - 1) as f64 * TEMPERATURE_STEP).min(TEMPERATURE_CAP);
            let focus = focus_for_index(i);
            ExpertInstanceSpec {
                expert_id: expert_id.to_string(),
                instance_index: i,
                replica_count,
                seed: i as u64 * 1000,
                temperature,
                focus_label: focus,
                instructions_text: Some(instructions_for_focus(focus)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_replica_is_legacy_shape() {
        let specs = build_instance_specs("claude", 1);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].focus_label, FocusLabel::General);
        assert!(specs[0].instructions_text.is_none());
    }

    #[test]
    fn replica_diversity_seeds_distinct_temperatures_increasing() {
        let specs = build_instance_specs("claude", 5);
        let seeds: Vec<u64> = specs.iter().map(|s| s.seed).collect();
        let distinct: std::collections::HashSet<u64> = seeds.iter().cloned().collect();
        assert_eq!(distinct.len(), seeds.len());

        for w in specs.windows(2) {
            assert!(
                w[1].temperature >= w[0].temperature,
                "temperatures should be non-decreasing: {:?}",
                specs.iter().map(|s| s.temperature).collect::<Vec<_>>()
            );
        }
        assert!(specs.iter().all(|s| s.temperature <= TEMPERATURE_CAP));
        assert_eq!(specs.last().unwrap().temperature, TEMPERATURE_CAP);
    }

    #[test]
    fn focus_labels_follow_ordered_list_then_alternatives() {
        let specs = build_instance_specs("claude", 5);
        assert_eq!(specs[0].focus_label, FocusLabel::Conservative);
        assert_eq!(specs[1].focus_label, FocusLabel::Innovative);
        assert_eq!(specs[2].focus_label, FocusLabel::Optimizing);
        assert_eq!(specs[3].focus_label, FocusLabel::Alternative(1));
        assert_eq!(specs[4].focus_label, FocusLabel::Alternative(2));
    }

    #[test]
    fn seeds_match_index_times_1000() {
        let specs = build_instance_specs("x", 3);
        assert_eq!(specs[0].seed, 1000);
        assert_eq!(specs[1].seed, 2000);
        assert_eq!(specs[2].seed, 3000);
    }
}
