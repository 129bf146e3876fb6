//! Thread-safe progress tracking for scan jobs.
//!
//! The tracker keeps every job started by one cache instance, so progress of
//! finished jobs stays queryable. Updates are short mutex sections; readers
//! get cloned snapshots and never wait on scan work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Lifecycle of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Idle,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl ScanStatus {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Cancelled | ScanStatus::Completed | ScanStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Failed)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Running, Failed)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

/// A file that could not be processed during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFailure {
    pub path: String,
    pub message: String,
}

/// Snapshot of one scan job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub job_id: String,
    pub roots: Vec<PathBuf>,
    pub status: ScanStatus,
    pub files_total: u64,
    pub files_processed: u64,
    pub files_hashed: u64,
    pub files_skipped: u64,
    /// Lookups answered definitively (found or not found).
    pub hashes_resolved: u64,
    /// Lookups queued and not answered yet.
    pub lookups_pending: u64,
    pub failures: Vec<FileFailure>,
    /// Structural failure message when `status` is `Failed`.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanProgress {
    pub fn new(job_id: impl Into<String>, roots: Vec<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            roots,
            status: ScanStatus::Idle,
            files_total: 0,
            files_processed: 0,
            files_hashed: 0,
            files_skipped: 0,
            hashes_resolved: 0,
            lookups_pending: 0,
            failures: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Tracks progress of the live job and of jobs that already finished.
#[derive(Debug, Default)]
pub struct ScanProgressTracker {
    state: Mutex<HashMap<String, ScanProgress>>,
}

impl ScanProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ScanProgress>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, progress: ScanProgress) {
        self.lock().insert(progress.job_id.clone(), progress);
    }

    pub fn get(&self, job_id: &str) -> Option<ScanProgress> {
        self.lock().get(job_id).cloned()
    }

    /// All tracked jobs, oldest first.
    pub fn list_all(&self) -> Vec<ScanProgress> {
        let mut jobs: Vec<ScanProgress> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.job_id.cmp(&b.job_id)));
        jobs
    }

    /// Move a job to `next` if the transition is legal.
    ///
    /// Returns whether the status changed.
    pub fn set_status(&self, job_id: &str, next: ScanStatus) -> bool {
        let mut state = self.lock();
        let Some(progress) = state.get_mut(job_id) else {
            return false;
        };
        if !progress.status.can_transition_to(next) {
            if progress.status != next {
                warn!(
                    "Ignoring scan {} transition {:?} -> {:?}",
                    job_id, progress.status, next
                );
            }
            return false;
        }
        progress.status = next;
        if next.is_terminal() {
            progress.finished_at = Some(Utc::now());
        }
        true
    }

    /// Mark a job Failed with a structural error message.
    pub fn fail(&self, job_id: &str, message: String) -> bool {
        let changed = self.set_status(job_id, ScanStatus::Failed);
        if changed {
            if let Some(progress) = self.lock().get_mut(job_id) {
                progress.error = Some(message);
            }
        }
        changed
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut ScanProgress)) {
        if let Some(progress) = self.lock().get_mut(job_id) {
            f(progress);
        }
    }
}

/// Per-job handle given to the scan loop and the resolver.
#[derive(Debug, Clone)]
pub struct JobProgress {
    tracker: Arc<ScanProgressTracker>,
    job_id: String,
}

impl JobProgress {
    pub fn new(tracker: Arc<ScanProgressTracker>, job_id: impl Into<String>) -> Self {
        Self {
            tracker,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> Option<ScanStatus> {
        self.tracker.get(&self.job_id).map(|p| p.status)
    }

    pub fn set_status(&self, next: ScanStatus) -> bool {
        self.tracker.set_status(&self.job_id, next)
    }

    pub fn fail(&self, message: String) -> bool {
        self.tracker.fail(&self.job_id, message)
    }

    pub fn set_total(&self, total: u64) {
        self.tracker.update(&self.job_id, |p| p.files_total = total);
    }

    pub fn file_hashed(&self) {
        self.tracker.update(&self.job_id, |p| {
            p.files_processed += 1;
            p.files_hashed += 1;
        });
    }

    pub fn file_skipped(&self) {
        self.tracker.update(&self.job_id, |p| {
            p.files_processed += 1;
            p.files_skipped += 1;
        });
    }

    pub fn file_failed(&self, path: String, message: String) {
        self.tracker.update(&self.job_id, |p| {
            p.files_processed += 1;
            p.failures.push(FileFailure { path, message });
        });
    }

    /// Failures found while enumerating; they are not counted as processed.
    pub fn walk_failed(&self, failure: FileFailure) {
        self.tracker.update(&self.job_id, |p| p.failures.push(failure));
    }

    pub fn lookup_queued(&self) {
        self.tracker.update(&self.job_id, |p| p.lookups_pending += 1);
    }

    /// A queued lookup finished; `resolved` is false when it was left pending.
    pub fn lookup_finished(&self, resolved: bool) {
        self.tracker.update(&self.job_id, |p| {
            p.lookups_pending = p.lookups_pending.saturating_sub(1);
            if resolved {
                p.hashes_resolved += 1;
            }
        });
    }
}
