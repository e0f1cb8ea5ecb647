//! ResultCache — content-addressed cache of `DebateResult`s, with optional
//! SQLite persistence (§4.K, §6 "Cache key canonicalisation").
//!
//! The persistence path is grounded on the teacher's `db.rs` (a
//! `synthesis_cache` table, written through `rusqlite`, saved via an atomic
//! snapshot) — here flattened to two tables (`cache_entries`, `cache_stats`)
//! since the cache has no relational query needs of its own, only atomic
//! whole-file persistence via `VACUUM INTO`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::invalidator::{CacheInvalidator, InvalidationContext, InvalidationStats};
use crate::types::{CacheEntry, DebateResult};

/// Everything that feeds the content-addressed key (§4.K).
#[derive(Debug, Clone, Serialize)]
pub struct CacheKeyInput {
    pub normalized_question: String,
    pub category: String,
    pub complexity_level: String,
    pub workdir: String,
    pub expert_replica_plan: Vec<(String, u32)>,
    pub use_analyzer: bool,
    pub project_fingerprint: Option<String>,
}

fn normalize_question(question: &str) -> String {
    question.trim().to_lowercase()
}

/// Canonical JSON (sorted keys — `serde_json::Map` is a `BTreeMap` without
/// the `preserve_order` feature, so `to_string` already sorts) hashed with
/// SHA-256 (§6 "Cache key canonicalisation").
pub fn compute_cache_key(input: &CacheKeyInput) -> String {
    let mut plan = input.expert_replica_plan.clone();
    plan.sort();
    let canonical = CacheKeyInput {
        expert_replica_plan: plan,
        normalized_question: normalize_question(&input.normalized_question),
        ..input.clone()
    };

    let json = serde_json::to_string(&canonical).expect("CacheKeyInput is always serializable");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub tokens_saved: u64,
    pub cost_saved: f64,
    hit_response_time_total_ms: u64,
    fresh_response_time_total_ms: u64,
    hit_count_for_avg: u64,
    fresh_count_for_avg: u64,
}

impl CacheStats {
    pub fn record_hit(&mut self, tokens: u64, cost: f64, response_time_ms: u64) {
        self.hits += 1;
        self.tokens_saved += tokens;
        self.cost_saved += cost;
        self.hit_response_time_total_ms += response_time_ms;
        self.hit_count_for_avg += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_store(&mut self) {
        self.stores += 1;
    }

    pub fn record_fresh(&mut self, response_time_ms: u64) {
        self.fresh_response_time_total_ms += response_time_ms;
        self.fresh_count_for_avg += 1;
    }

    pub fn avg_hit_response_time_ms(&self) -> f64 {
        if self.hit_count_for_avg == 0 {
            0.0
        } else {
            self.hit_response_time_total_ms as f64 / self.hit_count_for_avg as f64
        }
    }

    pub fn avg_fresh_response_time_ms(&self) -> f64 {
        if self.fresh_count_for_avg == 0 {
            0.0
        } else {
            self.fresh_response_time_total_ms as f64 / self.fresh_count_for_avg as f64
        }
    }
}

fn now_wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `ceil(|serialized-result-text| / 4)`, the token-estimation rule of §4.K.
pub fn estimate_tokens(result: &DebateResult) -> u64 {
    let serialized = serde_json::to_string(result).unwrap_or_default();
    ((serialized.len() as u64) + 3) / 4
}

pub struct ResultCache {
    max_entries: usize,
    cost_per_token: f64,
    persistence_path: Option<std::path::PathBuf>,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
    invalidation_stats: InvalidationStats,
}

impl ResultCache {
    pub fn new(max_entries: usize, cost_per_token: f64, persistence_path: Option<std::path::PathBuf>) -> Self {
        Self {
            max_entries,
            cost_per_token,
            persistence_path,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
                invalidation_stats: InvalidationStats::default(),
            }),
        }
    }

    /// Looks up `key`, running every invalidation predicate via `invalidator`
    /// against `context`. A stale hit is treated as a miss and evicted.
    pub fn lookup(
        &self,
        key: &str,
        invalidator: &CacheInvalidator,
        context: &InvalidationContext,
    ) -> Option<DebateResult> {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get(key).cloned() else {
            inner.stats.record_miss();
            return None;
        };

        let reasons = invalidator.check(&entry, context);
        if !reasons.is_empty() {
            inner.invalidation_stats.record(&reasons);
            inner.stats.invalidations += 1;
            inner.entries.remove(key);
            inner.stats.record_miss();
            return None;
        }

        let mut result = entry.result.clone();
        result.from_cache = true;
        result.cached_at = Some(entry.stored_at_wall_ms);
        inner
            .stats
            .record_hit(entry.estimated_tokens, entry.estimated_cost, result.response_time_ms);
        Some(result)
    }

    /// Stores `result` under `key`, evicting the smallest-`storedAt` entry
    /// first if at capacity (§4.K "Eviction").
    pub fn store(
        &self,
        key: String,
        result: DebateResult,
        project_fingerprint: Option<String>,
        observed_confidence: f64,
        manifest_mtime_ms: Option<u64>,
    ) {
        let estimated_tokens = estimate_tokens(&result);
        let estimated_cost = estimated_tokens as f64 * self.cost_per_token;
        let workdir = result.workdir.clone();
        let requested_expert_ids = result.experts_used.clone();

        let entry = CacheEntry {
            key: key.clone(),
            result,
            stored_at_wall_ms: now_wall_ms(),
            project_fingerprint,
            observed_confidence,
            estimated_tokens,
            estimated_cost,
            workdir,
            requested_expert_ids,
            manifest_mtime_ms,
        };

        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= self.max_entries && !inner.entries.contains_key(&key) {
            if let Some(evict_key) = inner
                .entries
                .values()
                .min_by_key(|e| e.stored_at_wall_ms)
                .map(|e| e.key.clone())
            {
                inner.entries.remove(&evict_key);
            }
        }
        inner.entries.insert(key, entry);
        inner.stats.record_store();
        drop(inner);

        self.persist();
    }

    pub fn record_fresh_response(&self, response_time_ms: u64) {
        self.inner.lock().unwrap().stats.record_fresh(response_time_ms);
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuilds `key` from a stored entry's own metadata — used to check the
    /// "canonical-key ↔ canonical-key" round-trip law (§8).
    pub fn rebuild_key_for(&self, key: &str, use_analyzer: bool) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(key)?;
        let plan: Vec<(String, u32)> = entry
            .requested_expert_ids
            .iter()
            .map(|id| (id.clone(), 1))
            .collect();
        Some(compute_cache_key(&CacheKeyInput {
            normalized_question: entry.result.question.clone(),
            category: entry.result.selection_analysis.category.clone(),
            complexity_level: format!("{:?}", entry.result.selection_analysis.complexity_level()),
            workdir: entry.workdir.clone(),
            expert_replica_plan: plan,
            use_analyzer,
            project_fingerprint: entry.project_fingerprint.clone(),
        }))
    }

    /// Snapshots `{entries, stats}` into a single SQLite file via an
    /// in-memory staging connection + `VACUUM INTO` a temp path, then renames
    /// over the configured persistence path — the atomic "written whole" rule
    /// of §5, grounded on the teacher's `synthesis_cache`/`decisions` tables
    /// but flattened to two simple tables since the cache has no relational
    /// query needs of its own.
    fn persist(&self) {
        let Some(path) = &self.persistence_path else {
            return;
        };
        let inner = self.inner.lock().unwrap();
        let entries = inner.entries.clone();
        let stats = inner.stats.clone();
        drop(inner);

        let tmp_path = path.with_extension("sqlite.tmp");
        let _ = std::fs::remove_file(&tmp_path);

        let result: rusqlite::Result<()> = (|| {
            let conn = rusqlite::Connection::open_in_memory()?;
            conn.execute_batch(
                "CREATE TABLE cache_entries (key TEXT PRIMARY KEY, entry_json TEXT NOT NULL, stored_at_wall_ms INTEGER NOT NULL);
                 CREATE TABLE cache_stats (id INTEGER PRIMARY KEY CHECK (id = 0), stats_json TEXT NOT NULL);",
            )?;

            {
                let mut insert_entry = conn.prepare(
                    "INSERT INTO cache_entries (key, entry_json, stored_at_wall_ms) VALUES (?1, ?2, ?3)",
                )?;
                for (key, entry) in &entries {
                    let json = serde_json::to_string(entry).unwrap_or_default();
                    insert_entry.execute(rusqlite::params![key, json, entry.stored_at_wall_ms as i64])?;
                }
            }
            conn.execute(
                "INSERT INTO cache_stats (id, stats_json) VALUES (0, ?1)",
                rusqlite::params![serde_json::to_string(&stats).unwrap_or_default()],
            )?;

            conn.execute("VACUUM INTO ?1", rusqlite::params![tmp_path.to_string_lossy()])?;
            Ok(())
        })();

        if result.is_ok() {
            let _ = std::fs::rename(&tmp_path, path);
        } else {
            let _ = std::fs::remove_file(&tmp_path);
        }
    }

    /// Loads a previously persisted `{entries, stats}` SQLite snapshot, if
    /// present.
    pub fn load(path: &std::path::Path) -> rusqlite::Result<Self> {
        let conn = rusqlite::Connection::open(path)?;

        let mut entries = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT key, entry_json FROM cache_entries")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                let entry_json: String = row.get(1)?;
                if let Ok(entry) = serde_json::from_str::<CacheEntry>(&entry_json) {
                    entries.insert(key, entry);
                }
            }
        }

        let stats: CacheStats = conn
            .query_row("SELECT stats_json FROM cache_stats WHERE id = 0", [], |row| {
                let json: String = row.get(0)?;
                Ok(serde_json::from_str(&json).unwrap_or_default())
            })
            .unwrap_or_default();

        Ok(Self {
            max_entries: entries.len().max(1),
            cost_per_token: 0.000_003,
            persistence_path: Some(path.to_path_buf()),
            inner: Mutex::new(CacheInner {
                entries,
                stats,
                invalidation_stats: InvalidationStats::default(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisSource, ConfidenceFactors, ConfidenceLevel, ConfidenceReport, QuestionAnalysis, Ranking};
    use std::collections::HashMap as StdHashMap;

    fn sample_result(text: &str) -> DebateResult {
        DebateResult {
            question: "what is 2+2?".to_string(),
            workdir: "/tmp/proj".to_string(),
            selection_analysis: QuestionAnalysis {
                category: "general/factual".to_string(),
                complexity: Some(0.1),
                criticality: Some(0.1),
                urgency: None,
                context_clues: vec![],
                reasoning_text: None,
                confidence_of_analysis: None,
                source: AnalysisSource::FallbackHeuristic,
            },
            experts_used: vec!["claude".to_string(), "gpt".to_string()],
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
            final_text: text.to_string(),
            confidence: ConfidenceReport {
                score: 90.0,
                level: ConfidenceLevel::VeryHigh,
                factors: ConfidenceFactors {
                    evaluator_score: 90.0,
                    verification_confidence: None,
                    score_dispersion: 0.0,
                    surviving_experts: 2,
                    used_fallback_ranking: false,
                },
                recommendation: "ok".to_string(),
                reasons: vec![],
            },
            response_time_ms: 5,
            from_cache: false,
            cached_at: None,
        }
    }

    fn input() -> CacheKeyInput {
        CacheKeyInput {
            normalized_question: "  What Is 2+2?  ".to_string(),
            category: "general/factual".to_string(),
            complexity_level: "trivial".to_string(),
            workdir: "/tmp/proj".to_string(),
            expert_replica_plan: vec![("gpt".to_string(), 1), ("claude".to_string(), 2)],
            use_analyzer: true,
            project_fingerprint: Some("fp1".to_string()),
        }
    }

    #[test]
    fn key_is_deterministic_and_order_independent() {
        let k1 = compute_cache_key(&input());
        let mut swapped = input();
        swapped.expert_replica_plan.reverse();
        let k2 = compute_cache_key(&swapped);
        assert_eq!(k1, k2);
    }

    #[test]
    fn key_is_case_and_whitespace_insensitive_on_question() {
        let k1 = compute_cache_key(&input());
        let mut other = input();
        other.normalized_question = "what is 2+2?".to_string();
        let k2 = compute_cache_key(&other);
        assert_eq!(k1, k2);
    }

    #[test]
    fn key_changes_with_fingerprint() {
        let k1 = compute_cache_key(&input());
        let mut other = input();
        other.project_fingerprint = Some("fp2".to_string());
        let k2 = compute_cache_key(&other);
        assert_ne!(k1, k2);
    }

    fn context_for(entry_workdir: &str, fingerprint: Option<&str>) -> InvalidationContext {
        InvalidationContext {
            now_wall_ms: now_wall_ms(),
            project_fingerprint: fingerprint.map(|s| s.to_string()),
            workdir: entry_workdir.to_string(),
            requested_expert_ids: vec!["claude".to_string(), "gpt".to_string()],
            user_requested_bypass: false,
            manifest_mtime_ms: None,
            project_state_changed: None,
        }
    }

    #[test]
    fn store_then_lookup_hits_with_byte_identical_text() {
        let cache = ResultCache::new(10, 0.000_003, None);
        let invalidator = CacheInvalidator::new(std::time::Duration::from_secs(3600), 0.0);
        let key = "k1".to_string();
        cache.store(key.clone(), sample_result("the answer is 4"), Some("fp1".to_string()), 0.9, None);

        let context = context_for("/tmp/proj", Some("fp1"));
        let hit = cache.lookup(&key, &invalidator, &context).unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.final_text, "the answer is 4");
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = ResultCache::new(10, 0.000_003, None);
        let invalidator = CacheInvalidator::new(std::time::Duration::from_secs(3600), 0.0);
        let context = context_for("/tmp/proj", Some("fp1"));
        assert!(cache.lookup("nope", &invalidator, &context).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn eviction_drops_oldest_entry_at_capacity() {
        let cache = ResultCache::new(1, 0.000_003, None);
        cache.store("k1".to_string(), sample_result("first"), None, 0.9, None);
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.store("k2".to_string(), sample_result("second"), None, 0.9, None);

        assert_eq!(cache.len(), 1);
        let invalidator = CacheInvalidator::new(std::time::Duration::from_secs(3600), 0.0);
        let context = context_for("/tmp/proj", None);
        assert!(cache.lookup("k1", &invalidator, &context).is_none());
        assert!(cache.lookup("k2", &invalidator, &context).is_some());
    }

    #[test]
    fn fingerprint_mismatch_invalidates_on_lookup() {
        let cache = ResultCache::new(10, 0.000_003, None);
        cache.store("k1".to_string(), sample_result("cached"), Some("fp1".to_string()), 0.9, None);

        let invalidator = CacheInvalidator::new(std::time::Duration::from_secs(3600), 0.0);
        let stale_context = context_for("/tmp/proj", Some("fp2"));
        assert!(cache.lookup("k1", &invalidator, &stale_context).is_none());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn persist_then_load_round_trips_entries_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");

        let cache = ResultCache::new(10, 0.000_003, Some(path.clone()));
        cache.store("k1".to_string(), sample_result("persisted answer"), Some("fp1".to_string()), 0.9, None);

        let reloaded = ResultCache::load(&path).expect("reload persisted cache");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.stats().stores, 1);

        let invalidator = CacheInvalidator::new(std::time::Duration::from_secs(3600), 0.0);
        let context = context_for("/tmp/proj", Some("fp1"));
        let hit = reloaded.lookup("k1", &invalidator, &context).unwrap();
        assert_eq!(hit.final_text, "persisted answer");
    }
}
