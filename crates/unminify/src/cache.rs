//! On-disk caching of rename mappings and deferred-batch state.
//!
//! The cache directory is the only shared mutable resource in the system.
//! Every function gets its own file (filename = cache key), so concurrent
//! writers within one process never collide, and cross-process access is
//! last-writer-wins per entry with no locking. All cache I/O failures are
//! demoted to misses: a broken cache slows a run down, it never fails one.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::mapping::RenameMapping;

/// One cached oracle decision.
///
/// The stored model makes a hit valid only for the model that produced it;
/// switching models re-asks the oracle without clearing the cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CacheEntry {
    /// The cache key, repeated inside the file for debuggability.
    pub hash: String,
    /// The cached mapping.
    pub mapping: RenameMapping,
    /// When the entry was created.
    pub timestamp: DateTime<Utc>,
    /// Model identifier that produced the mapping.
    pub model: String,
}

/// Persistent record of a submitted deferred batch.
///
/// Namespaced by a short hash of the project working directory so two
/// projects sharing a cache directory never observe each other's pending
/// jobs. This is the only live state that crosses process restarts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    /// Remote batch identifier assigned by the provider.
    pub batch_id: String,
    /// Hash of the source the batch was submitted for.
    pub source_hash: String,
    /// Where the finished output should be written.
    pub output_path: String,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Model the batch was submitted against.
    pub model: String,
    /// Number of functions in the batch.
    pub function_count: usize,
    /// Input file name, for context in messages.
    pub file_name: String,
    /// Short hash of the project working directory.
    pub project_id: String,
}

/// The function-level rename cache plus batch-state storage.
#[derive(Debug, Clone)]
pub struct RenameCache {
    dir: Option<PathBuf>,
}

impl RenameCache {
    /// A cache rooted at `dir`. The directory is created lazily on first
    /// write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A cache that stores nothing and never hits.
    #[must_use]
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Whether this cache persists anything.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Cache key for a function: the first 16 hex characters of the
    /// SHA-256 of the whitespace-normalized source, so whitespace-only
    /// edits (reindentation, blank lines) do not invalidate entries.
    #[must_use]
    pub fn cache_key(function_source: &str) -> String {
        let normalized: Vec<&str> = function_source.split_whitespace().collect();
        let digest = Sha256::digest(normalized.join(" ").as_bytes());
        hex_prefix(&digest, 16)
    }

    /// Hash of a whole source file, used to match batch state to input.
    #[must_use]
    pub fn source_hash(source: &str) -> String {
        hex_prefix(&Sha256::digest(source.as_bytes()), 16)
    }

    /// Short namespace hash for a project working directory.
    #[must_use]
    pub fn project_id(workdir: &Path) -> String {
        hex_prefix(&Sha256::digest(workdir.to_string_lossy().as_bytes()), 8)
    }

    /// Looks up a cached mapping. Misses on absence, I/O failure,
    /// undecodable JSON, or a model mismatch.
    #[must_use]
    pub fn get(&self, key: &str, model: &str) -> Option<RenameMapping> {
        let path = self.dir.as_ref()?.join(format!("{key}.json"));
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache read failed; treating as miss");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cache entry undecodable; treating as miss");
                return None;
            }
        };
        (entry.model == model).then_some(entry.mapping)
    }

    /// Durably stores one function's mapping. Failures are logged and
    /// swallowed; the mapping is still used for the current run.
    pub fn put(&self, key: &str, mapping: &RenameMapping, model: &str) {
        let Some(dir) = self.dir.as_ref() else {
            return;
        };
        let entry = CacheEntry {
            hash: key.to_owned(),
            mapping: mapping.clone(),
            timestamp: Utc::now(),
            model: model.to_owned(),
        };
        if let Err(e) = fs::create_dir_all(dir)
            .and_then(|()| fs::write(dir.join(format!("{key}.json")), serde_json::to_vec_pretty(&entry).unwrap_or_default()))
        {
            tracing::warn!(key, error = %e, "cache write failed; entry not persisted");
        }
    }

    fn batch_state_path(&self, project_id: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("pending-batch-{project_id}.json")))
    }

    /// Loads the pending-batch record for a project, if one exists.
    #[must_use]
    pub fn load_batch_state(&self, project_id: &str) -> Option<BatchState> {
        let path = self.batch_state_path(project_id)?;
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "batch state undecodable; ignoring");
                None
            }
        }
    }

    /// Persists the pending-batch record.
    pub fn save_batch_state(&self, state: &BatchState) {
        let Some(path) = self.batch_state_path(&state.project_id) else {
            return;
        };
        if let Some(dir) = self.dir.as_ref() {
            if let Err(e) = fs::create_dir_all(dir)
                .and_then(|()| fs::write(&path, serde_json::to_vec_pretty(state).unwrap_or_default()))
            {
                tracing::warn!(path = %path.display(), error = %e, "batch state write failed");
            }
        }
    }

    /// Removes the pending-batch record after retrieval or abandonment.
    pub fn clear_batch_state(&self, project_id: &str) {
        let Some(path) = self.batch_state_path(project_id) else {
            return;
        };
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "batch state removal failed");
            }
        }
    }
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        if out.len() >= chars {
            break;
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_edits_do_not_change_the_key() {
        let compact = "function a(x,y){return x+y;}";
        let spread = "function a(x,y)\n{\n    return x+y;\n}\n";
        assert_eq!(RenameCache::cache_key(compact), RenameCache::cache_key(spread));
    }

    #[test]
    fn content_edits_change_the_key() {
        let a = "function a(x,y){return x+y;}";
        let b = "function a(x,y){return x-y;}";
        assert_ne!(RenameCache::cache_key(a), RenameCache::cache_key(b));
        assert_eq!(RenameCache::cache_key(a).len(), 16);
    }

    #[test]
    fn model_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = RenameCache::new(dir.path());
        let mapping = RenameMapping {
            function_name: Some("add".to_owned()),
            ..RenameMapping::default()
        };
        cache.put("abcd", &mapping, "gpt-4o");
        assert_eq!(cache.get("abcd", "gpt-4o"), Some(mapping));
        assert_eq!(cache.get("abcd", "claude-sonnet-4"), None);
    }
}
