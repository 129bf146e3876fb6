//! Scan cancellation.
//!
//! One [`CancellationToken`] is created per scan job and handed to the hash
//! pipeline, the resolver and every retry loop. Workers poll it at safe points
//! (before scheduling a file, before a registry request); sleeping work can
//! await [`CancellationToken::cancelled`] instead so a backoff does not delay
//! the job reaching `Cancelled`. Work already in flight is allowed to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    notify: Notify,
}

/// Shared cancellation flag for one scan job.
///
/// Clones observe the same flag. Cancelling is one-way.
///
/// ```
/// use modelcache_core::cancel::CancellationToken;
///
/// let job = CancellationToken::new();
/// let resolver = job.clone();
///
/// job.cancel();
/// assert!(resolver.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<CancelState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every task parked in [`cancelled`].
    ///
    /// [`cancelled`]: CancellationToken::cancelled
    pub fn cancel(&self) {
        if !self.state.requested.swap(true, Ordering::SeqCst) {
            self.state.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// `Err(CancelledError)` once cancellation was requested.
    pub fn check(&self) -> Result<(), CancelledError> {
        match self.is_cancelled() {
            true => Err(CancelledError),
            false => Ok(()),
        }
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            // Registered before the flag check so a concurrent cancel is not missed.
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `delay`, returning early with `Err` if the job is cancelled.
    pub async fn sleep(&self, delay: Duration) -> Result<(), CancelledError> {
        tokio::select! {
            _ = self.cancelled() => Err(CancelledError),
            _ = tokio::time::sleep(delay) => self.check(),
        }
    }
}

/// The job was cancelled before this piece of work started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("scan job was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::CacheError {
    fn from(_: CancelledError) -> Self {
        crate::error::CacheError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    #[test]
    fn test_fresh_token_passes_check() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert_eq!(token.check(), Ok(()));
    }

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let job = CancellationToken::new();
        let worker = job.clone();

        worker.cancel();
        worker.cancel();

        assert!(job.is_cancelled());
        let err: CacheError = job.check().unwrap_err().into();
        assert!(matches!(err, CacheError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already cancelled: returns immediately.
        token.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cut_short() {
        let token = CancellationToken::new();
        assert_eq!(token.sleep(Duration::from_millis(10)).await, Ok(()));

        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move { token.sleep(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert_eq!(sleeper.await.unwrap(), Err(CancelledError));
    }
}
