//! Project fingerprint and the optional project-state tracker (§4.K, §4.L;
//! supplemented feature, SPEC_FULL.md §10.5).
//!
//! Grounded on the teacher's `walkdir`-based filesystem scanning, redirected
//! from locating source files to score from to building a cheap
//! content-agnostic fingerprint of a working directory for cache
//! invalidation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use walkdir::WalkDir;

const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "coverage", "dist", "build"];
const FINGERPRINT_SENTINEL_UNKNOWN: &str = "unknown";

/// MD5 over the sorted list of `(relative path, mtime-nanos, size)` for
/// tracked files under `workdir`, capped at `max_files` and restricted to
/// `tracked_extensions`. Returns the `"unknown"` sentinel if the scan fails
/// outright (e.g. the directory doesn't exist).
pub fn compute_fingerprint(workdir: &str, tracked_extensions: &[String], max_files: usize) -> String {
    let root = Path::new(workdir);
    if !root.is_dir() {
        return FINGERPRINT_SENTINEL_UNKNOWN.to_string();
    }

    let mut records: Vec<(String, u128, u64)> = Vec::new();

    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| !SKIPPED_DIRS.contains(&name))
                .unwrap_or(true)
        })
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let has_tracked_ext = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| tracked_extensions.iter().any(|t| t == ext));
        if !has_tracked_ext {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mtime_nanos = metadata
            .modified()
            .ok()
            .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();

        records.push((relative, mtime_nanos, metadata.len()));
        if records.len() >= max_files {
            break;
        }
    }

    records.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Md5::new();
    for (path, mtime_nanos, size) in &records {
        hasher.update(path.as_bytes());
        hasher.update(mtime_nanos.to_le_bytes());
        hasher.update(size.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Snapshot of one workdir's state, as seen by the independent tracker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectStateSnapshot {
    pub key_file_mtimes: HashMap<String, u128>,
    pub dependency_map: HashMap<String, String>,
    pub head_commit: Option<String>,
}

/// Optional per-workdir tracker: consulted only when enabled (§4.L
/// "projectChanged"). Writes are serialized per workdir via an internal
/// mutex, mirroring §5's "one record per workdir; writes are serialized".
#[derive(Default)]
pub struct ProjectStateTracker {
    snapshots: Mutex<HashMap<String, ProjectStateSnapshot>>,
}

impl ProjectStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest snapshot for `workdir`, returning whether it
    /// differs materially from the previous one (mtime/addition/removal of a
    /// key file, dependency map inequality, or head-commit inequality).
    pub fn observe(&self, workdir: &str, snapshot: ProjectStateSnapshot) -> bool {
        let mut snapshots = self.snapshots.lock().unwrap();
        let changed = match snapshots.get(workdir) {
            Some(previous) => is_material_change(previous, &snapshot),
            None => false,
        };
        snapshots.insert(workdir.to_string(), snapshot);
        changed
    }
}

fn is_material_change(previous: &ProjectStateSnapshot, current: &ProjectStateSnapshot) -> bool {
    previous.key_file_mtimes != current.key_file_mtimes
        || previous.dependency_map != current.dependency_map
        || previous.head_commit != current.head_commit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_dir_returns_unknown_sentinel() {
        let fp = compute_fingerprint("/nonexistent/path/xyz", &["rs".to_string()], 50);
        assert_eq!(fp, FINGERPRINT_SENTINEL_UNKNOWN);
    }

    #[test]
    fn fingerprint_is_deterministic_for_unchanged_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        let extensions = vec!["rs".to_string()];
        let fp1 = compute_fingerprint(dir.path().to_str().unwrap(), &extensions, 50);
        let fp2 = compute_fingerprint(dir.path().to_str().unwrap(), &extensions, 50);
        assert_eq!(fp1, fp2);
        assert_ne!(fp1, FINGERPRINT_SENTINEL_UNKNOWN);
    }

    #[test]
    fn fingerprint_changes_when_file_is_touched() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rs");
        fs::write(&file, "fn main() {}").unwrap();
        let extensions = vec!["rs".to_string()];
        let fp1 = compute_fingerprint(dir.path().to_str().unwrap(), &extensions, 50);

        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(&file, "fn main() { println!(\"x\"); }").unwrap();
        let fp2 = compute_fingerprint(dir.path().to_str().unwrap(), &extensions, 50);
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn untracked_extension_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let fp = compute_fingerprint(dir.path().to_str().unwrap(), &["rs".to_string()], 50);
        // No tracked files found still yields a stable (non-sentinel) hash of the empty set.
        assert_ne!(fp, FINGERPRINT_SENTINEL_UNKNOWN);
    }

    #[test]
    fn tracker_detects_key_file_mtime_change() {
        let tracker = ProjectStateTracker::new();
        let mut first = ProjectStateSnapshot::default();
        first.key_file_mtimes.insert("Cargo.toml".to_string(), 100);
        assert!(!tracker.observe("/proj", first.clone()));

        let mut second = first.clone();
        second.key_file_mtimes.insert("Cargo.toml".to_string(), 200);
        assert!(tracker.observe("/proj", second));
    }

    #[test]
    fn tracker_no_change_returns_false() {
        let tracker = ProjectStateTracker::new();
        let snapshot = ProjectStateSnapshot::default();
        tracker.observe("/proj", snapshot.clone());
        assert!(!tracker.observe("/proj", snapshot));
    }
}
