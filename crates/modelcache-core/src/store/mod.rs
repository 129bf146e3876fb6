//! Persistence layer: the hash-indexed store.
//!
//! Three JSON maps live in the data directory:
//! - `hashes.json` - normalized path -> content hash
//! - `file_signatures.json` - normalized path -> size/mtime signature
//! - `model_info.json` - content hash -> [`ModelInfo`]
//!
//! All reads and writes go through an in-memory snapshot guarded by a
//! `std::sync::RwLock`. Critical sections only touch the maps; file I/O
//! happens outside the lock. Loads and saves are serialized by one async
//! mutex, so a reload never installs a disk copy older than a save that
//! finished while it was reading. Saves are coalesced when nothing changed
//! since the last completed save.

mod atomic;
mod types;

pub use atomic::{atomic_read_json, atomic_write_json, quarantine_corrupt};
pub use types::{
    looks_like_hash, normalize_hash, FileRecord, FileSignature, ModelInfo, SHA256_HEX_LEN,
};

use crate::config::{CacheConfig, PathsConfig};
use crate::error::{CacheError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Size + mtime of a persisted map, used to skip reloading unchanged files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

fn fingerprint(path: &Path) -> Option<Fingerprint> {
    std::fs::metadata(path).ok().map(|m| Fingerprint {
        len: m.len(),
        modified: m.modified().ok(),
    })
}

/// Locations of the three persisted maps.
#[derive(Debug, Clone)]
struct StoreFiles {
    hashes: PathBuf,
    signatures: PathBuf,
    info: PathBuf,
}

impl StoreFiles {
    fn fingerprints(&self) -> [Option<Fingerprint>; 3] {
        [
            fingerprint(&self.hashes),
            fingerprint(&self.signatures),
            fingerprint(&self.info),
        ]
    }
}

/// Outcome of [`HashStore::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// False when no file changed since the previous load or save.
    pub reloaded: bool,
    pub files: usize,
    pub infos: usize,
    /// Malformed files that were replaced by empty maps.
    pub recovered: Vec<PathBuf>,
}

/// Read-only copy of the maps used by the deduplication engine.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub hashes: HashMap<String, String>,
    pub info: HashMap<String, ModelInfo>,
}

/// Counts used for stats reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCounts {
    pub files: usize,
    pub infos: usize,
    pub found: usize,
    /// Entries the registry answered with a definitive not-found.
    pub not_found: usize,
    /// Distinct hashes still waiting for a registry answer: file hashes with
    /// no ModelInfo, plus local placeholders never answered.
    pub pending: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    hashes: HashMap<String, String>,
    signatures: HashMap<String, FileSignature>,
    info: HashMap<String, ModelInfo>,
    /// Path keys changed in memory and not yet saved, with the generation of
    /// their last change.
    dirty_paths: HashMap<String, u64>,
    /// Hash keys changed in memory and not yet saved.
    dirty_hashes: HashMap<String, u64>,
    generation: u64,
    saved_generation: u64,
    fingerprints: [Option<Fingerprint>; 3],
}

impl StoreState {
    fn touch_path(&mut self, path: &str) {
        self.generation += 1;
        self.dirty_paths.insert(path.to_string(), self.generation);
    }

    fn touch_hash(&mut self, hash: &str) {
        self.generation += 1;
        self.dirty_hashes.insert(hash.to_string(), self.generation);
    }
}

/// The persistent path/hash/metadata store.
#[derive(Debug)]
pub struct HashStore {
    files: StoreFiles,
    state: RwLock<StoreState>,
    /// Held for the whole of every load and save.
    io_lock: tokio::sync::Mutex<()>,
}

impl HashStore {
    /// Create a store whose maps live in the configured data directory.
    ///
    /// Nothing is read until [`HashStore::load`] is called.
    pub fn new(config: &CacheConfig) -> Self {
        Self::in_dir(&config.data_dir)
    }

    /// Create a store rooted at an explicit directory.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            files: StoreFiles {
                hashes: data_dir.join(PathsConfig::HASHES_FILENAME),
                signatures: data_dir.join(PathsConfig::SIGNATURES_FILENAME),
                info: data_dir.join(PathsConfig::MODEL_INFO_FILENAME),
            },
            state: RwLock::new(StoreState::default()),
            io_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================
    // Load / Save
    // ========================================

    /// Reload the maps from disk.
    ///
    /// Never fails: a missing file is an empty map, a malformed file is moved
    /// aside and replaced by an empty map. Unsaved in-memory changes are
    /// re-applied on top of what was read. Waits for an in-progress save.
    pub async fn load(&self) -> LoadReport {
        let _guard = self.io_lock.lock().await;
        let files = self.files.clone();
        let current = files.fingerprints();
        if self.read().fingerprints == current && current.iter().any(Option::is_some) {
            let state = self.read();
            return LoadReport {
                reloaded: false,
                files: state.hashes.len(),
                infos: state.info.len(),
                recovered: Vec::new(),
            };
        }

        let loaded = tokio::task::spawn_blocking(move || {
            let mut recovered = Vec::new();
            let hashes = read_map::<String>(&files.hashes, &mut recovered);
            let signatures = read_map::<FileSignature>(&files.signatures, &mut recovered);
            let info = read_map::<ModelInfo>(&files.info, &mut recovered);
            (hashes, signatures, info, recovered, files.fingerprints())
        })
        .await;

        let (hashes, signatures, info, recovered, fingerprints) = match loaded {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Store load task failed: {}", e);
                let state = self.read();
                return LoadReport {
                    reloaded: false,
                    files: state.hashes.len(),
                    infos: state.info.len(),
                    recovered: Vec::new(),
                };
            }
        };

        let mut state = self.write();

        if let Some(mut disk_hashes) = hashes {
            let mut disk_signatures = signatures.unwrap_or_default();
            for path in state.dirty_paths.keys() {
                match state.hashes.get(path) {
                    Some(hash) => {
                        disk_hashes.insert(path.clone(), hash.clone());
                    }
                    None => {
                        disk_hashes.remove(path);
                    }
                }
                match state.signatures.get(path) {
                    Some(sig) => {
                        disk_signatures.insert(path.clone(), *sig);
                    }
                    None => {
                        disk_signatures.remove(path);
                    }
                }
            }
            state.hashes = disk_hashes;
            state.signatures = disk_signatures;
        }

        if let Some(disk_info) = info {
            let mut merged: HashMap<String, ModelInfo> = HashMap::with_capacity(disk_info.len());
            for (key, mut entry) in disk_info {
                match normalize_hash(&key) {
                    Ok(hash) => {
                        entry.hash = hash.clone();
                        merged.insert(hash, entry);
                    }
                    Err(_) => warn!("Dropping model info with invalid hash key {:?}", key),
                }
            }
            for hash in state.dirty_hashes.keys() {
                match state.info.get(hash) {
                    Some(entry) => {
                        merged.insert(hash.clone(), entry.clone());
                    }
                    None => {
                        merged.remove(hash);
                    }
                }
            }
            state.info = merged;
        }

        state.fingerprints = fingerprints;
        debug!(
            "Loaded store: {} files, {} info entries",
            state.hashes.len(),
            state.info.len()
        );

        LoadReport {
            reloaded: true,
            files: state.hashes.len(),
            infos: state.info.len(),
            recovered,
        }
    }

    /// Persist the in-memory maps atomically.
    ///
    /// Returns `false` when the save was coalesced because nothing changed
    /// since the last completed save.
    pub async fn save(&self) -> Result<bool> {
        let _guard = self.io_lock.lock().await;

        let (generation, write_paths, write_hashes, hashes, signatures, info) = {
            let state = self.read();
            if state.generation == state.saved_generation {
                return Ok(false);
            }
            let write_paths = !state.dirty_paths.is_empty();
            let write_hashes = !state.dirty_hashes.is_empty();
            (
                state.generation,
                write_paths,
                write_hashes,
                write_paths.then(|| state.hashes.clone()),
                write_paths.then(|| state.signatures.clone()),
                write_hashes.then(|| state.info.clone()),
            )
        };

        let files = self.files.clone();
        let fingerprints = tokio::task::spawn_blocking(move || -> Result<_> {
            if let Some(hashes) = hashes {
                atomic_write_json(&files.hashes, &hashes)?;
            }
            if let Some(signatures) = signatures {
                atomic_write_json(&files.signatures, &signatures)?;
            }
            if let Some(info) = info {
                atomic_write_json(&files.info, &info)?;
            }
            Ok(files.fingerprints())
        })
        .await
        .map_err(|e| CacheError::Other(format!("Store save task failed: {}", e)))??;

        let mut state = self.write();
        state.saved_generation = generation;
        if write_paths {
            state.dirty_paths.retain(|_, changed| *changed > generation);
        }
        if write_hashes {
            state.dirty_hashes.retain(|_, changed| *changed > generation);
        }
        // Changes that landed while writing keep generation > saved_generation.
        state.fingerprints = fingerprints;

        debug!("Saved store at generation {}", generation);
        Ok(true)
    }

    /// Whether there are changes not yet written to disk.
    pub fn has_unsaved_changes(&self) -> bool {
        let state = self.read();
        state.generation != state.saved_generation
    }

    // ========================================
    // Path -> hash
    // ========================================

    pub fn get_hash(&self, path: &str) -> Option<String> {
        self.read().hashes.get(path).cloned()
    }

    pub fn get_signature(&self, path: &str) -> Option<FileSignature> {
        self.read().signatures.get(path).copied()
    }

    /// Full record for one path.
    pub fn get_record(&self, path: &str) -> Option<FileRecord> {
        let state = self.read();
        state.hashes.get(path).map(|hash| FileRecord {
            path: path.to_string(),
            hash: hash.clone(),
            signature: state.signatures.get(path).copied(),
        })
    }

    /// Insert or replace a file record. Only called once hashing completed.
    pub fn set_record(&self, record: FileRecord) {
        let mut state = self.write();
        state.touch_path(&record.path);
        match record.signature {
            Some(sig) => {
                state.signatures.insert(record.path.clone(), sig);
            }
            None => {
                state.signatures.remove(&record.path);
            }
        }
        state.hashes.insert(record.path, record.hash);
    }

    /// Remove a file record, returning its hash.
    pub fn remove_record(&self, path: &str) -> Option<String> {
        let mut state = self.write();
        let removed = state.hashes.remove(path);
        state.signatures.remove(path);
        if removed.is_some() {
            state.touch_path(path);
        }
        removed
    }

    pub fn all_hashes(&self) -> HashMap<String, String> {
        self.read().hashes.clone()
    }

    /// Every indexed path sharing `hash`, sorted.
    pub fn paths_for_hash(&self, hash: &str) -> Vec<String> {
        let state = self.read();
        let mut paths: Vec<String> = state
            .hashes
            .iter()
            .filter(|(_, h)| h.as_str() == hash)
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    // ========================================
    // Hash -> info
    // ========================================

    pub fn get_info(&self, hash: &str) -> Option<ModelInfo> {
        self.read().info.get(hash).cloned()
    }

    pub fn has_info(&self, hash: &str) -> bool {
        self.read().info.contains_key(hash)
    }

    pub fn all_info(&self) -> HashMap<String, ModelInfo> {
        self.read().info.clone()
    }

    /// Replace the info entry for its hash.
    pub fn set_info(&self, info: ModelInfo) {
        let mut state = self.write();
        state.touch_hash(&info.hash);
        state.info.insert(info.hash.clone(), info);
    }

    /// Read-modify-write one info entry inside a single critical section.
    ///
    /// The closure sees `None` when no entry exists; leaving `None` in place
    /// removes the entry. Only an actual change marks the entry unsaved.
    /// `f` must not block.
    pub fn modify_info<R>(&self, hash: &str, f: impl FnOnce(&mut Option<ModelInfo>) -> R) -> R {
        let mut state = self.write();
        let before = state.info.remove(hash);
        let mut entry = before.clone();
        let result = f(&mut entry);
        if let Some(info) = entry.as_mut() {
            info.hash = hash.to_string();
        }
        if entry != before {
            state.touch_hash(hash);
        }
        if let Some(info) = entry {
            state.info.insert(hash.to_string(), info);
        }
        result
    }

    // ========================================
    // Views
    // ========================================

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.read();
        StoreSnapshot {
            hashes: state.hashes.clone(),
            info: state.info.clone(),
        }
    }

    pub fn counts(&self) -> StoreCounts {
        let state = self.read();
        let found = state.info.values().filter(|i| i.civitai_found).count();
        let not_found = state
            .info
            .values()
            .filter(|i| !i.civitai_found && i.fetched_at.is_some())
            .count();
        let unanswered = state
            .info
            .values()
            .filter(|i| !i.civitai_found && i.fetched_at.is_none())
            .map(|i| &i.hash);
        let pending: HashSet<&String> = state
            .hashes
            .values()
            .filter(|h| !state.info.contains_key(h.as_str()))
            .chain(unanswered)
            .collect();
        StoreCounts {
            files: state.hashes.len(),
            infos: state.info.len(),
            found,
            not_found,
            pending: pending.len(),
        }
    }

    pub fn data_files(&self) -> [&Path; 3] {
        [
            self.files.hashes.as_path(),
            self.files.signatures.as_path(),
            self.files.info.as_path(),
        ]
    }
}

/// Read one map, substituting an empty map for a malformed file.
///
/// Returns `None` only when the file exists but could not be read, in which
/// case the caller keeps its current in-memory map.
fn read_map<T: DeserializeOwned + Serialize>(
    path: &Path,
    recovered: &mut Vec<PathBuf>,
) -> Option<HashMap<String, T>> {
    match atomic_read_json::<HashMap<String, T>>(path) {
        Ok(Some(map)) => Some(map),
        Ok(None) => Some(HashMap::new()),
        Err(CacheError::Json { message, .. }) => {
            warn!("Persisted map is corrupt, starting empty: {}", message);
            if let Some(moved) = quarantine_corrupt(path) {
                info!("Kept corrupt copy at {}", moved.display());
            }
            recovered.push(path.to_path_buf());
            Some(HashMap::new())
        }
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const H1: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const H2: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    fn record(path: &str, hash: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            hash: hash.to_string(),
            signature: Some(FileSignature {
                size: 10,
                mtime_ms: 1_700_000_000_000,
            }),
        }
    }

    #[tokio::test]
    async fn test_load_missing_files_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());

        let report = store.load().await;
        assert_eq!(report.files, 0);
        assert_eq!(report.infos, 0);
        assert!(report.recovered.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());
        store.set_record(record("/m/a.safetensors", H1));
        store.set_info(ModelInfo::not_found(H1));
        assert!(store.save().await.unwrap());

        let other = HashStore::in_dir(temp_dir.path());
        let report = other.load().await;
        assert!(report.reloaded);
        assert_eq!(other.get_hash("/m/a.safetensors").as_deref(), Some(H1));
        assert_eq!(
            other.get_signature("/m/a.safetensors").map(|s| s.size),
            Some(10)
        );
        assert!(!other.get_info(H1).unwrap().civitai_found);

        // hashes.json stays a plain path -> hash string map
        let raw: HashMap<String, String> =
            atomic_read_json(&temp_dir.path().join(PathsConfig::HASHES_FILENAME))
                .unwrap()
                .unwrap();
        assert_eq!(raw.get("/m/a.safetensors").map(String::as_str), Some(H1));
    }

    #[tokio::test]
    async fn test_save_coalesces_when_clean() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());
        store.set_record(record("/m/a.safetensors", H1));

        assert!(store.save().await.unwrap());
        assert!(!store.save().await.unwrap());
        assert!(!store.has_unsaved_changes());
    }

    #[tokio::test]
    async fn test_corrupt_file_recovers_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let info_path = temp_dir.path().join(PathsConfig::MODEL_INFO_FILENAME);
        std::fs::write(&info_path, b"{\"broken\": ").unwrap();

        let store = HashStore::in_dir(temp_dir.path());
        let report = store.load().await;

        assert_eq!(report.infos, 0);
        assert_eq!(report.recovered, vec![info_path.clone()]);
        assert!(temp_dir
            .path()
            .join(format!("{}.corrupt", PathsConfig::MODEL_INFO_FILENAME))
            .exists());
    }

    #[tokio::test]
    async fn test_reload_keeps_unsaved_changes() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());
        store.set_record(record("/m/a.safetensors", H1));
        store.save().await.unwrap();

        // Another process adds an entry on disk.
        let external = HashStore::in_dir(temp_dir.path());
        external.load().await;
        external.set_record(record("/m/b.safetensors", H2));
        external.save().await.unwrap();

        // Meanwhile this instance has an unsaved change of its own.
        store.set_info(ModelInfo::not_found(H1));
        let report = store.load().await;

        assert!(report.reloaded);
        assert_eq!(store.get_hash("/m/b.safetensors").as_deref(), Some(H2));
        assert!(store.get_info(H1).is_some());
        assert!(store.has_unsaved_changes());
    }

    #[tokio::test]
    async fn test_modify_info_creates_and_removes() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());

        store.modify_info(H1, |entry| {
            assert!(entry.is_none());
            *entry = Some(ModelInfo::local_placeholder(H1));
        });
        assert!(store.get_info(H1).unwrap().stale);

        store.modify_info(H1, |entry| *entry = None);
        assert!(store.get_info(H1).is_none());
    }

    #[tokio::test]
    async fn test_counts_and_paths_for_hash() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());
        store.set_record(record("/m/b.safetensors", H1));
        store.set_record(record("/m/a.safetensors", H1));
        store.set_record(record("/m/c.safetensors", H2));
        store.set_info(ModelInfo::not_found(H1));

        let counts = store.counts();
        assert_eq!(counts.files, 3);
        assert_eq!(counts.infos, 1);
        assert_eq!(counts.not_found, 1);
        assert_eq!(counts.pending, 1);

        assert_eq!(
            store.paths_for_hash(H1),
            vec!["/m/a.safetensors".to_string(), "/m/b.safetensors".to_string()]
        );
    }

    #[tokio::test]
    async fn test_placeholders_count_as_pending() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());
        store.set_record(record("/m/a.safetensors", H1));
        store.set_info(ModelInfo::local_placeholder(H1));
        store.set_info(ModelInfo::not_found(H2));

        let counts = store.counts();
        assert_eq!(counts.infos, 2);
        assert_eq!(counts.found, 0);
        assert_eq!(counts.not_found, 1);
        assert_eq!(counts.pending, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_load_and_save_keep_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(HashStore::in_dir(temp_dir.path()));
        let external = HashStore::in_dir(temp_dir.path());

        for i in 0..200u32 {
            // Another process touches model_info.json so the next load reads disk.
            external.set_info(ModelInfo::not_found(format!("{:064x}", i)));
            external.save().await.unwrap();

            store.set_record(record(&format!("/m/{}.safetensors", i), H1));
            let saver = {
                let store = store.clone();
                tokio::spawn(async move { store.save().await })
            };
            let loader = {
                let store = store.clone();
                tokio::spawn(async move { store.load().await })
            };
            saver.await.unwrap().unwrap();
            loader.await.unwrap();
        }
        store.save().await.unwrap();

        assert_eq!(store.all_hashes().len(), 200);
        let on_disk = HashStore::in_dir(temp_dir.path());
        on_disk.load().await;
        assert_eq!(on_disk.all_hashes().len(), 200);
    }

    #[tokio::test]
    async fn test_remove_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::in_dir(temp_dir.path());
        store.set_record(record("/m/a.safetensors", H1));

        assert_eq!(store.remove_record("/m/a.safetensors").as_deref(), Some(H1));
        assert!(store.get_signature("/m/a.safetensors").is_none());
        assert_eq!(store.remove_record("/m/a.safetensors"), None);
    }
}
