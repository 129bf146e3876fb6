//! Remote resolver: turns pending hashes into ModelInfo entries.
//!
//! Lookups run on a bounded pool; each request also passes through the
//! client's token bucket. Transient and rejected failures leave the hash
//! pending so a later scan tries again.

use super::client::RegistryLookup;
use super::retry::{retry_async, RetryConfig};
use super::types::LookupOutcome;
use crate::cancel::CancellationToken;
use crate::error::{CacheError, Result};
use crate::scanner::JobProgress;
use crate::store::{HashStore, ModelInfo};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// What happened to one hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum ResolveOutcome {
    Found,
    NotFound,
    /// Metadata is already current; no request was made.
    Skipped,
    /// No definitive answer; the hash stays without ModelInfo or keeps its
    /// previous entry.
    Pending(String),
}

impl ResolveOutcome {
    pub fn is_definitive(&self) -> bool {
        matches!(self, ResolveOutcome::Found | ResolveOutcome::NotFound)
    }
}

/// Resolves hashes against the registry and merges answers into the store.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<HashStore>,
    lookup: Arc<dyn RegistryLookup>,
    retry: RetryConfig,
    max_age: Option<chrono::Duration>,
    permits: Arc<Semaphore>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("retry", &self.retry)
            .field("max_age", &self.max_age)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl Resolver {
    pub fn new(
        store: Arc<HashStore>,
        lookup: Arc<dyn RegistryLookup>,
        retry: RetryConfig,
        max_concurrent: usize,
        max_age: Option<chrono::Duration>,
    ) -> Self {
        Self {
            store,
            lookup,
            retry,
            max_age,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Whether a normal scan should look `hash` up.
    pub fn needs_lookup(&self, hash: &str) -> bool {
        match self.store.get_info(hash) {
            None => true,
            Some(info) => info.needs_refresh(self.max_age, Utc::now()),
        }
    }

    /// Resolve one hash.
    ///
    /// Without `force`, hashes whose metadata is current are skipped, which
    /// keeps not-found answers sticky. With `force` the registry is always
    /// asked.
    pub async fn resolve_one(
        &self,
        hash: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ResolveOutcome> {
        if !force && !self.needs_lookup(hash) {
            return Ok(ResolveOutcome::Skipped);
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CacheError::Other("Resolver pool closed".to_string()))?;
        cancel.check()?;

        let lookup = self.lookup.clone();
        let (result, stats) =
            retry_async(&self.retry, cancel, || lookup.lookup_by_hash(hash, cancel)).await;

        match result {
            Ok(LookupOutcome::Found(remote)) => {
                debug!(
                    "Registry match for {}: model {} after {} attempt(s)",
                    hash, remote.model_id, stats.attempts
                );
                self.store.modify_info(hash, |entry| {
                    entry
                        .get_or_insert_with(|| ModelInfo {
                            hash: hash.to_string(),
                            ..Default::default()
                        })
                        .apply_remote(remote)
                });
                Ok(ResolveOutcome::Found)
            }
            Ok(LookupOutcome::NotFound) => {
                debug!("Registry has no model for {}", hash);
                self.record_not_found(hash);
                Ok(ResolveOutcome::NotFound)
            }
            Ok(LookupOutcome::Malformed(reason)) => {
                warn!(
                    "Malformed registry response for {}, recording as not found: {}",
                    hash, reason
                );
                self.record_not_found(hash);
                Ok(ResolveOutcome::NotFound)
            }
            Err(CacheError::Cancelled) => Err(CacheError::Cancelled),
            Err(e @ CacheError::RegistryRejected { .. }) => {
                warn!("Registry rejected lookup for {}, leaving pending: {}", hash, e);
                Ok(ResolveOutcome::Pending(e.to_string()))
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Registry lookup for {} failed after {} attempt(s), leaving pending: {}",
                    hash, stats.attempts, e
                );
                Ok(ResolveOutcome::Pending(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn record_not_found(&self, hash: &str) {
        self.store.modify_info(hash, |entry| match entry {
            Some(info) => info.apply_not_found(),
            None => *entry = Some(ModelInfo::not_found(hash)),
        });
    }

    /// Drain a queue of hashes until the sender closes or `cancel` fires.
    ///
    /// Hashes still queued at cancellation are dropped and stay pending.
    pub async fn run(
        &self,
        mut queue: mpsc::Receiver<String>,
        cancel: CancellationToken,
        force: bool,
        progress: JobProgress,
    ) {
        let mut tasks = JoinSet::new();
        let mut resolved = 0u64;

        while let Some(hash) = queue.recv().await {
            if cancel.is_cancelled() {
                progress.lookup_finished(false);
                continue;
            }

            let resolver = self.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            tasks.spawn(async move {
                let definitive = match resolver.resolve_one(&hash, force, &cancel).await {
                    Ok(outcome) => outcome.is_definitive(),
                    Err(CacheError::Cancelled) => false,
                    Err(e) => {
                        warn!("Lookup for {} failed: {}", hash, e);
                        false
                    }
                };
                progress.lookup_finished(definitive);
                definitive
            });

            while let Some(joined) = tasks.try_join_next() {
                resolved += u64::from(joined.unwrap_or(false));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            resolved += u64::from(joined.unwrap_or(false));
        }

        info!(
            "Resolver finished for scan {}: {} hash(es) resolved",
            progress.job_id(),
            resolved
        );
    }
}
