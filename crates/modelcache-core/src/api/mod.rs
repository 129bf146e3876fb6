//! Cache facade.
//!
//! [`ModelCache`] is the single entry point for collaborators. It owns the
//! store, the scan job slot and the resolver; handles are cheap to clone and
//! share one underlying cache. Every read reloads the store first so changes
//! written by another process are visible.

mod builder;
mod responses;

pub use builder::ModelCacheBuilder;
pub use responses::{CacheStats, HashLookup, PathLookup, PullResult};

use crate::cancel::CancellationToken;
use crate::config::CacheConfig;
use crate::dedup::{self, normalize_path, DuplicateGroup, GhostEntry, VersionGroup};
use crate::error::{CacheError, Result};
use crate::hashing;
use crate::registry::Resolver;
use crate::scanner::{
    JobProgress, ScanOptions, ScanProgress, ScanProgressTracker, ScanStatus, Scanner,
};
use crate::store::{
    looks_like_hash, normalize_hash, FileRecord, FileSignature, HashStore, LoadReport, ModelInfo,
};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

/// Keys owned by typed ModelInfo fields; local metadata may not use them.
const RESERVED_INFO_KEYS: &[&str] = &[
    "hash",
    "civitaiFound",
    "modelId",
    "modelVersionId",
    "name",
    "versionName",
    "baseModel",
    "modelType",
    "lastUsed",
    "fetchedAt",
    "stale",
    "raw",
];

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The live scan job.
struct ActiveScan {
    job_id: String,
    cancel: CancellationToken,
}

pub(crate) struct CacheInner {
    config: Arc<CacheConfig>,
    store: Arc<HashStore>,
    resolver: Resolver,
    scanner: Scanner,
    tracker: Arc<ScanProgressTracker>,
    active: Mutex<Option<ActiveScan>>,
}

/// Handle to a model hash cache.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("data_dir", &self.inner.config.data_dir)
            .finish()
    }
}

fn path_key(path: &Path) -> Result<String> {
    if path.as_os_str().is_empty() {
        return Err(CacheError::invalid("path", "must not be empty"));
    }
    Ok(normalize_path(path))
}

impl ModelCache {
    /// Build a cache with the default CivitAI client.
    pub async fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    pub fn builder(config: CacheConfig) -> ModelCacheBuilder {
        ModelCacheBuilder::new(config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveScan>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn live_job_id(&self) -> Option<String> {
        let active = self.active();
        active.as_ref().and_then(|scan| {
            let status = self.inner.tracker.get(&scan.job_id)?.status;
            (!status.is_terminal()).then(|| scan.job_id.clone())
        })
    }

    // ========================================
    // Persistence
    // ========================================

    /// Reload the persisted maps.
    pub async fn load(&self) -> LoadReport {
        self.inner.store.load().await
    }

    /// Write pending changes. Returns `false` when there was nothing to write.
    pub async fn save(&self) -> Result<bool> {
        self.inner.store.save().await
    }

    // ========================================
    // Reads
    // ========================================

    pub async fn get_info_by_hash(&self, hash: &str) -> Result<Option<ModelInfo>> {
        let hash = normalize_hash(hash)?;
        self.load().await;
        Ok(self.inner.store.get_info(&hash))
    }

    pub async fn get_hash_by_path(&self, path: impl AsRef<Path>) -> Result<Option<String>> {
        let key = path_key(path.as_ref())?;
        self.load().await;
        Ok(self.inner.store.get_hash(&key))
    }

    pub async fn get_all_info(&self) -> HashMap<String, ModelInfo> {
        self.load().await;
        self.inner.store.all_info()
    }

    pub async fn get_all_hashes(&self) -> HashMap<String, String> {
        self.load().await;
        self.inner.store.all_hashes()
    }

    pub async fn get_stats(&self) -> CacheStats {
        self.load().await;
        let counts = self.inner.store.counts();
        CacheStats {
            total_files: counts.files,
            total_info: counts.infos,
            found_on_registry: counts.found,
            not_found_on_registry: counts.not_found,
            pending: counts.pending,
            storage_locations: self.inner.config.model_roots.clone(),
        }
    }

    /// Metadata and every indexed path for one hash.
    ///
    /// `None` when the hash is neither indexed nor has metadata.
    pub async fn get_by_hash(&self, hash: &str) -> Result<Option<HashLookup>> {
        let hash = normalize_hash(hash)?;
        self.load().await;
        let info = self.inner.store.get_info(&hash);
        let paths = self.inner.store.paths_for_hash(&hash);
        if info.is_none() && paths.is_empty() {
            return Ok(None);
        }
        Ok(Some(HashLookup { hash, info, paths }))
    }

    /// Hash, metadata and same-content siblings of one indexed path.
    pub async fn get_by_path(&self, path: impl AsRef<Path>) -> Result<Option<PathLookup>> {
        let key = path_key(path.as_ref())?;
        self.load().await;
        let Some(hash) = self.inner.store.get_hash(&key) else {
            return Ok(None);
        };
        let sibling_paths = self
            .inner
            .store
            .paths_for_hash(&hash)
            .into_iter()
            .filter(|p| *p != key)
            .collect();
        Ok(Some(PathLookup {
            info: self.inner.store.get_info(&hash),
            path: key,
            hash,
            sibling_paths,
        }))
    }

    // ========================================
    // Scanning
    // ========================================

    /// Start a background scan and return its job id.
    ///
    /// An empty `roots` list scans the configured model roots. Fails with
    /// `AlreadyRunning` while another job is live.
    pub async fn start_scan(&self, roots: Vec<PathBuf>, options: ScanOptions) -> Result<String> {
        let roots = if roots.is_empty() {
            self.inner.config.model_roots.clone()
        } else {
            roots
        };
        if roots.is_empty() {
            return Err(CacheError::invalid("roots", "no scan roots given or configured"));
        }
        if roots.iter().any(|r| r.as_os_str().is_empty()) {
            return Err(CacheError::invalid("roots", "must not contain empty paths"));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        {
            let mut active = self.active();
            if let Some(scan) = active.as_ref() {
                let live = self
                    .inner
                    .tracker
                    .get(&scan.job_id)
                    .is_some_and(|p| !p.status.is_terminal());
                if live {
                    return Err(CacheError::AlreadyRunning {
                        job_id: scan.job_id.clone(),
                    });
                }
            }

            self.inner
                .tracker
                .insert(ScanProgress::new(job_id.clone(), roots.clone()));
            self.inner.tracker.set_status(&job_id, ScanStatus::Running);
            *active = Some(ActiveScan {
                job_id: job_id.clone(),
                cancel: cancel.clone(),
            });
        }

        info!("Starting scan {} over {:?}", job_id, roots);
        let job = JobProgress::new(self.inner.tracker.clone(), job_id.clone());
        let store = self.inner.store.clone();
        let scanner = self.inner.scanner.clone();
        tokio::spawn(async move {
            store.load().await;
            scanner.run(job, roots, options, cancel).await
        });

        Ok(job_id)
    }

    pub fn get_scan_progress(&self, job_id: &str) -> Option<ScanProgress> {
        self.inner.tracker.get(job_id)
    }

    /// Progress of every job run by this instance, oldest first.
    pub fn scan_history(&self) -> Vec<ScanProgress> {
        self.inner.tracker.list_all()
    }

    /// Request cancellation of a job.
    ///
    /// Files already being hashed finish; the job then reaches `Cancelled`.
    /// Cancelling a finished job returns its final progress unchanged.
    pub fn cancel_scan(&self, job_id: &str) -> Result<ScanProgress> {
        let Some(progress) = self.inner.tracker.get(job_id) else {
            return Err(CacheError::NotFound {
                what: format!("scan job {}", job_id),
            });
        };
        if progress.status.is_terminal() {
            return Ok(progress);
        }

        if let Some(scan) = self.active().as_ref().filter(|s| s.job_id == job_id) {
            scan.cancel.cancel();
        }
        self.inner.tracker.set_status(job_id, ScanStatus::Cancelling);
        info!("Cancellation requested for scan {}", job_id);

        self.inner.tracker.get(job_id).ok_or_else(|| CacheError::NotFound {
            what: format!("scan job {}", job_id),
        })
    }

    /// Wait until a job reaches a terminal status.
    pub async fn wait_for_scan(&self, job_id: &str) -> Result<ScanProgress> {
        loop {
            let progress = self
                .get_scan_progress(job_id)
                .ok_or_else(|| CacheError::NotFound {
                    what: format!("scan job {}", job_id),
                })?;
            if progress.status.is_terminal() {
                return Ok(progress);
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    // ========================================
    // Metadata
    // ========================================

    /// Re-query the registry for one hash or file, bypassing sticky answers.
    ///
    /// A path that is not indexed yet but exists on disk is hashed first.
    pub async fn pull_metadata(&self, hash_or_path: &str) -> Result<PullResult> {
        let target = hash_or_path.trim();
        if target.is_empty() {
            return Err(CacheError::invalid("hashOrPath", "must not be empty"));
        }
        self.load().await;

        let (hash, path, hashed) = if looks_like_hash(target) {
            (normalize_hash(target)?, None, false)
        } else {
            let file = PathBuf::from(target);
            let key = path_key(&file)?;
            match self.inner.store.get_hash(&key) {
                Some(hash) => (hash, Some(key), false),
                None => (self.hash_unindexed(&file, &key).await?, Some(key), true),
            }
        };

        let outcome = self
            .inner
            .resolver
            .resolve_one(&hash, true, &CancellationToken::new())
            .await?;
        if let Err(e) = self.save().await {
            warn!("Failed to save after pulling metadata for {}: {}", hash, e);
        }

        Ok(PullResult {
            info: self.inner.store.get_info(&hash),
            hash,
            path,
            hashed,
            outcome,
        })
    }

    async fn hash_unindexed(&self, file: &Path, key: &str) -> Result<String> {
        let metadata = match tokio::fs::metadata(file).await {
            Ok(m) if m.is_file() => m,
            _ => {
                return Err(CacheError::NotFound {
                    what: format!("model file {}", file.display()),
                })
            }
        };
        let hash = hashing::hash_file(file).await?;
        self.inner.store.set_record(FileRecord {
            path: key.to_string(),
            hash: hash.clone(),
            signature: Some(FileSignature::from_metadata(&metadata)),
        });
        Ok(hash)
    }

    /// Flag an entry so the next normal scan queries the registry again.
    ///
    /// Returns `false` when the hash has no metadata.
    pub async fn mark_stale(&self, hash: &str) -> Result<bool> {
        let hash = normalize_hash(hash)?;
        self.load().await;
        let changed = self.inner.store.modify_info(&hash, |entry| match entry {
            Some(info) => {
                info.stale = true;
                true
            }
            None => false,
        });
        self.save().await?;
        Ok(changed)
    }

    /// Record that a model was just used.
    pub async fn mark_used(&self, hash: &str) -> Result<bool> {
        let hash = normalize_hash(hash)?;
        self.load().await;
        let changed = self.inner.store.modify_info(&hash, |entry| match entry {
            Some(info) => {
                info.last_used = Some(Utc::now());
                true
            }
            None => false,
        });
        self.save().await?;
        Ok(changed)
    }

    /// Merge locally extracted metadata into the entry for `hash`.
    ///
    /// Unknown hashes get a stale placeholder so a later scan still asks the
    /// registry. Keys that belong to typed fields are rejected.
    pub async fn record_local_info(
        &self,
        hash: &str,
        fields: Map<String, Value>,
    ) -> Result<ModelInfo> {
        let hash = normalize_hash(hash)?;
        if let Some(key) = fields
            .keys()
            .find(|k| RESERVED_INFO_KEYS.contains(&k.as_str()))
        {
            return Err(CacheError::invalid(
                "fields",
                format!("{} is managed by the cache", key),
            ));
        }

        self.load().await;
        let info = self.inner.store.modify_info(&hash, |entry| {
            let info = entry.get_or_insert_with(|| ModelInfo::local_placeholder(hash.clone()));
            info.extra.extend(fields);
            info.clone()
        });
        self.save().await?;
        Ok(info)
    }

    // ========================================
    // Deduplication and maintenance
    // ========================================

    pub async fn find_duplicates(&self) -> Vec<DuplicateGroup> {
        self.load().await;
        dedup::find_duplicates(&self.inner.store.snapshot())
    }

    pub async fn find_ghosts(&self) -> Result<Vec<GhostEntry>> {
        self.load().await;
        let snapshot = self.inner.store.snapshot();
        tokio::task::spawn_blocking(move || dedup::find_ghosts(&snapshot))
            .await
            .map_err(|e| CacheError::Other(format!("Ghost check task failed: {}", e)))
    }

    pub async fn version_groups(&self) -> Vec<VersionGroup> {
        self.load().await;
        dedup::version_groups(&self.inner.store.snapshot())
    }

    /// Remove records of files that no longer exist. ModelInfo is kept.
    ///
    /// Refused while a scan is live.
    pub async fn prune_ghosts(&self) -> Result<Vec<GhostEntry>> {
        if let Some(job_id) = self.live_job_id() {
            return Err(CacheError::AlreadyRunning { job_id });
        }

        let ghosts = self.find_ghosts().await?;
        for ghost in &ghosts {
            self.inner.store.remove_record(&ghost.path);
        }
        if !ghosts.is_empty() {
            info!("Pruned {} ghost record(s)", ghosts.len());
            self.save().await?;
        }
        Ok(ghosts)
    }
}
