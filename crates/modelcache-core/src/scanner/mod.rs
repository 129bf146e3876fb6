//! Scan pipeline: enumerate, hash, record, queue lookups.
//!
//! A scan walks the roots, hashes changed files on a bounded pool, writes
//! each FileRecord once its hash is known, and feeds hashes that still need
//! registry metadata to the [`Resolver`] over a channel. Unchanged files
//! (same size and mtime as recorded) are never re-hashed.

mod progress;
mod walk;

pub use progress::{FileFailure, JobProgress, ScanProgress, ScanProgressTracker, ScanStatus};
pub use walk::{collect_model_files, WalkOutcome};

use crate::cancel::CancellationToken;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::hashing;
use crate::registry::Resolver;
use crate::store::{FileRecord, FileSignature, HashStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const LOOKUP_QUEUE_CAPACITY: usize = 256;

/// Per-scan switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanOptions {
    /// Hash every file even when its signature is unchanged.
    pub force_rehash: bool,
    /// Query the registry for every hash seen, ignoring sticky answers.
    pub refresh_metadata: bool,
    /// Only hash; leave registry lookups for a later scan.
    pub skip_lookups: bool,
}

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileOutcome {
    Hashed(String),
    Unchanged(String),
}

/// Runs scan jobs against one store.
#[derive(Debug, Clone)]
pub struct Scanner {
    store: Arc<HashStore>,
    config: Arc<CacheConfig>,
    resolver: Resolver,
}

impl Scanner {
    pub fn new(store: Arc<HashStore>, config: Arc<CacheConfig>, resolver: Resolver) -> Self {
        Self {
            store,
            config,
            resolver,
        }
    }

    /// Run one job to a terminal status and return that status.
    pub async fn run(
        &self,
        job: JobProgress,
        roots: Vec<PathBuf>,
        options: ScanOptions,
        cancel: CancellationToken,
    ) -> ScanStatus {
        if job.status() == Some(ScanStatus::Idle) {
            job.set_status(ScanStatus::Running);
        }
        if cancel.is_cancelled() {
            return finish_cancelled(&job);
        }
        info!("Scan {} started over {} root(s)", job.job_id(), roots.len());

        let config = self.config.clone();
        let walk_roots = roots.clone();
        let walked =
            tokio::task::spawn_blocking(move || collect_model_files(&walk_roots, &config))
                .await
                .map_err(|e| CacheError::Other(format!("Walk task failed: {}", e)))
                .and_then(|r| r);

        let walked = match walked {
            Ok(walked) => walked,
            Err(e) => {
                error!("Scan {} failed: {}", job.job_id(), e);
                job.fail(e.to_string());
                return ScanStatus::Failed;
            }
        };

        job.set_total(walked.files.len() as u64);
        for failure in walked.failures {
            job.walk_failed(failure);
        }

        let (tx, rx) = mpsc::channel(LOOKUP_QUEUE_CAPACITY);
        let resolver_task = if options.skip_lookups {
            drop(rx);
            None
        } else {
            let resolver = self.resolver.clone();
            let cancel = cancel.clone();
            let job = job.clone();
            let force = options.refresh_metadata;
            Some(tokio::spawn(async move {
                resolver.run(rx, cancel, force, job).await
            }))
        };

        let mut pipeline = Pipeline {
            scanner: self,
            job: &job,
            options: &options,
            queue: resolver_task.as_ref().map(|_| tx),
            enqueued: HashSet::new(),
            since_save: 0,
        };
        pipeline.hash_files(walked.files, &cancel).await;
        // Closing the queue lets the resolver finish what was sent.
        drop(pipeline);

        if let Some(task) = resolver_task {
            if let Err(e) = task.await {
                warn!("Resolver task for scan {} ended abnormally: {}", job.job_id(), e);
            }
        }

        if let Err(e) = self.store.save().await {
            error!("Scan {} could not persist results: {}", job.job_id(), e);
            job.fail(format!("Failed to save store: {}", e));
            return ScanStatus::Failed;
        }

        let status = finish(&job, &cancel);
        info!("Scan {} finished: {:?}", job.job_id(), status);
        status
    }
}

/// Settle a job whose work is done.
///
/// A cancel request can mark the job `Cancelling` after the token was last
/// polled; the tracker refuses `Completed` then and the job ends `Cancelled`.
fn finish(job: &JobProgress, cancel: &CancellationToken) -> ScanStatus {
    if !cancel.is_cancelled() && job.set_status(ScanStatus::Completed) {
        return ScanStatus::Completed;
    }
    finish_cancelled(job)
}

/// Move a cancelled job through Cancelling to Cancelled.
fn finish_cancelled(job: &JobProgress) -> ScanStatus {
    if job.status() == Some(ScanStatus::Running) {
        job.set_status(ScanStatus::Cancelling);
    }
    job.set_status(ScanStatus::Cancelled);
    job.status().unwrap_or(ScanStatus::Cancelled)
}

/// State of one running scan loop.
struct Pipeline<'a> {
    scanner: &'a Scanner,
    job: &'a JobProgress,
    options: &'a ScanOptions,
    queue: Option<mpsc::Sender<String>>,
    enqueued: HashSet<String>,
    since_save: usize,
}

impl Pipeline<'_> {
    async fn hash_files(&mut self, files: Vec<(String, PathBuf)>, cancel: &CancellationToken) {
        let workers = Arc::new(Semaphore::new(self.scanner.config.hash_workers.max(1)));
        let mut tasks = JoinSet::new();

        for (key, path) in files {
            if cancel.is_cancelled() {
                info!("Scan {} cancelled, stopping before {}", self.job.job_id(), key);
                break;
            }

            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let store = self.scanner.store.clone();
            let force_rehash = self.options.force_rehash;
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = process_file(&store, &key, path, force_rehash).await;
                (key, outcome)
            });

            while let Some(joined) = tasks.try_join_next() {
                self.handle(joined).await;
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.handle(joined).await;
        }
    }

    async fn handle(
        &mut self,
        joined: std::result::Result<(String, Result<FileOutcome>), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((key, Ok(outcome))) => {
                let hash = match outcome {
                    FileOutcome::Hashed(hash) => {
                        debug!("Hashed {} -> {}", key, hash);
                        self.job.file_hashed();
                        hash
                    }
                    FileOutcome::Unchanged(hash) => {
                        self.job.file_skipped();
                        hash
                    }
                };
                self.enqueue(hash).await;
            }
            Ok((key, Err(e))) => {
                debug!("Failed to process {}: {}", key, e);
                self.job.file_failed(key, e.to_string());
            }
            Err(e) => {
                warn!("Hash task ended abnormally: {}", e);
                self.job.file_failed(String::new(), e.to_string());
            }
        }

        self.since_save += 1;
        let save_every = self.scanner.config.save_every;
        if save_every > 0 && self.since_save >= save_every {
            self.since_save = 0;
            if let Err(e) = self.scanner.store.save().await {
                warn!("Periodic save during scan {} failed: {}", self.job.job_id(), e);
            }
        }
    }

    /// Queue a hash for lookup at most once per job.
    async fn enqueue(&mut self, hash: String) {
        let Some(queue) = &self.queue else {
            return;
        };
        if self.enqueued.contains(&hash) {
            return;
        }
        if !self.options.refresh_metadata && !self.scanner.resolver.needs_lookup(&hash) {
            return;
        }
        self.enqueued.insert(hash.clone());
        self.job.lookup_queued();
        if queue.send(hash).await.is_err() {
            self.job.lookup_finished(false);
            self.queue = None;
        }
    }
}

/// Hash `path` unless its signature matches the stored one.
async fn process_file(
    store: &HashStore,
    key: &str,
    path: PathBuf,
    force_rehash: bool,
) -> Result<FileOutcome> {
    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| CacheError::io_with_path(e, &path))?;
    let signature = FileSignature::from_metadata(&metadata);

    if !force_rehash && store.get_signature(key) == Some(signature) {
        if let Some(hash) = store.get_hash(key) {
            return Ok(FileOutcome::Unchanged(hash));
        }
    }

    let hash = hashing::hash_file(path).await?;
    store.set_record(FileRecord {
        path: key.to_string(),
        hash: hash.clone(),
        signature: Some(signature),
    });
    Ok(FileOutcome::Hashed(hash))
}
