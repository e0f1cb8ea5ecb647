//! Append-only per-request JSON log (§4.M, §6 "Persisted state layout").
//!
//! One file per request, named `debate_<monotonic-nanos>.json`. On
//! structural failure the `DebateResult` is absent but the log is still
//! written with `failed=true` (§7 "Log is still written with a failed=true
//! marker").

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::types::{DebateResult, QuestionAnalysis, RetryStats};

#[derive(Debug, Serialize)]
pub struct RequestLogRecord {
    pub result: Option<DebateResult>,
    pub selection_analysis: Option<QuestionAnalysis>,
    pub retry_stats: RetryStats,
    pub failed: bool,
    pub error: Option<String>,
}

impl RequestLogRecord {
    pub fn success(result: DebateResult, retry_stats: RetryStats) -> Self {
        Self {
            selection_analysis: Some(result.selection_analysis.clone()),
            result: Some(result),
            retry_stats,
            failed: false,
            error: None,
        }
    }

    pub fn failure(selection_analysis: Option<QuestionAnalysis>, retry_stats: RetryStats, error: impl Into<String>) -> Self {
        Self {
            result: None,
            selection_analysis,
            retry_stats,
            failed: true,
            error: Some(error.into()),
        }
    }
}

fn log_file_name(monotonic_nanos: u64) -> String {
    format!("debate_{monotonic_nanos}.json")
}

pub fn write_request_log(log_dir: &Path, monotonic_nanos: u64, record: &RequestLogRecord) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(log_file_name(monotonic_nanos));
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(&path, json)?;
    Ok(path)
}
