//! LearningSink — write-only, opaque-to-the-core outcome stream (§1, §6
//! "Learning sink"; supplemented feature, SPEC_FULL.md §10.5).
//!
//! Grounded on the teacher's append-only `framework_adjustments` ledger
//! idiom (there backed by SQLite rows); expressed here as a small trait so
//! the host can redirect it anywhere, with a JSONL file sink as the
//! concrete default.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One emitted outcome tuple (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub category: String,
    pub experts_used: Vec<String>,
    pub winner: String,
    pub per_expert_score: HashMap<String, f64>,
    pub per_expert_duration_ms: HashMap<String, u64>,
    pub cost_reduction_pct: Option<f64>,
}

/// `record(LearningRecord)` — the core only ever calls this, never reads
/// back through it (§1 "write-only... opaque to the core beyond emission").
pub trait LearningSink: Send + Sync {
    fn record(&self, record: LearningRecord);
}

pub struct NoopLearningSink;

impl LearningSink for NoopLearningSink {
    fn record(&self, _record: LearningRecord) {}
}

/// Append-only JSONL sink. A write failure is swallowed (§7 "Degradation...
/// learning-sink failure → swallowed") — it must never fail the debate.
pub struct JsonlLearningSink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlLearningSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    fn open(&self) -> std::io::Result<std::fs::File> {
        std::fs::OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl LearningSink for JsonlLearningSink {
    fn record(&self, record: LearningRecord) {
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            *guard = self.open().ok();
        }
        if let Some(file) = guard.as_mut() {
            if writeln!(file, "{line}").is_err() {
                tracing::warn!(path = %self.path.display(), "learning sink: write failed, continuing");
                *guard = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LearningRecord {
        LearningRecord {
            category: "security".to_string(),
            experts_used: vec!["claude".to_string(), "gpt".to_string()],
            winner: "claude".to_string(),
            per_expert_score: [("claude".to_string(), 90.0)].into_iter().collect(),
            per_expert_duration_ms: [("claude".to_string(), 1200)].into_iter().collect(),
            cost_reduction_pct: Some(15.0),
        }
    }

    #[test]
    fn noop_sink_never_panics() {
        NoopLearningSink.record(sample());
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learning.jsonl");
        let sink = JsonlLearningSink::new(&path);
        sink.record(sample());
        sink.record(sample());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"winner\":\"claude\""));
    }
}
