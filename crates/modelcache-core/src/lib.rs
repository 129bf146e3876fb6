//! modelcache core - hash-indexed cache of local model files.
//!
//! Indexes checkpoints and LoRAs by SHA-256 content hash, enriches each hash
//! with CivitAI registry metadata, and reports duplicates, ghost records and
//! version groups. It can be used programmatically without any HTTP layer.
//!
//! # Example
//!
//! ```rust,no_run
//! use modelcache_core::{CacheConfig, ModelCache, ScanOptions};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> modelcache_core::Result<()> {
//!     let mut config = CacheConfig::with_data_dir("/var/lib/modelcache");
//!     config.model_roots = vec!["/srv/models".into()];
//!     let cache = ModelCache::new(config).await?;
//!
//!     let job_id = cache.start_scan(vec![], ScanOptions::default()).await?;
//!     let progress = cache.wait_for_scan(&job_id).await?;
//!     println!("Processed {} files", progress.files_processed);
//!
//!     for group in cache.find_duplicates().await {
//!         println!("{}: {:?}", group.hash, group.paths);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod dedup;
pub mod error;
pub mod hashing;
pub mod registry;
pub mod scanner;
pub mod store;

mod api;

pub use api::{CacheStats, HashLookup, ModelCache, ModelCacheBuilder, PathLookup, PullResult};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{CacheConfig, RegistryConfig};
pub use dedup::{DuplicateGroup, GhostEntry, VersionGroup};
pub use error::{CacheError, Result};
pub use registry::{LookupOutcome, RegistryLookup, RemoteModel, ResolveOutcome};
pub use scanner::{FileFailure, ScanOptions, ScanProgress, ScanStatus};
pub use store::{FileRecord, FileSignature, ModelInfo};
