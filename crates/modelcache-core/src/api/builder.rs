//! Builder for configuring ModelCache initialization.

use std::sync::Arc;

use crate::api::{CacheInner, ModelCache};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::registry::{CivitaiClient, RegistryLookup, Resolver, RetryConfig};
use crate::scanner::{ScanProgressTracker, Scanner};
use crate::store::HashStore;
use tracing::{info, warn};

/// Builder for configuring ModelCache initialization.
///
/// # Example
///
/// ```rust,no_run
/// use modelcache_core::{CacheConfig, ModelCache};
///
/// # async fn demo() -> modelcache_core::Result<()> {
/// let cache = ModelCache::builder(CacheConfig::with_data_dir("./cache-data"))
///     .create_data_dir(true)
///     .build()
///     .await?;
/// println!("{:?}", cache.get_stats().await);
/// # Ok(())
/// # }
/// ```
pub struct ModelCacheBuilder {
    config: CacheConfig,
    create_data_dir: bool,
    lookup: Option<Arc<dyn RegistryLookup>>,
}

impl ModelCacheBuilder {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            create_data_dir: false,
            lookup: None,
        }
    }

    /// Create the data directory during `build` if it does not exist.
    ///
    /// Default: `false` (created lazily by the first save)
    pub fn create_data_dir(mut self, enable: bool) -> Self {
        self.create_data_dir = enable;
        self
    }

    /// Use a custom registry instead of the CivitAI HTTP client.
    pub fn with_registry(mut self, lookup: Arc<dyn RegistryLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Validate the configuration, wire the components and load the store.
    pub async fn build(self) -> Result<ModelCache> {
        self.config.validate()?;

        if self.create_data_dir && !self.config.data_dir.exists() {
            std::fs::create_dir_all(&self.config.data_dir).map_err(|e| CacheError::Io {
                message: format!(
                    "Failed to create data directory: {}",
                    self.config.data_dir.display()
                ),
                path: Some(self.config.data_dir.clone()),
                source: Some(e),
            })?;
        }

        let lookup: Arc<dyn RegistryLookup> = match self.lookup {
            Some(lookup) => lookup,
            None => Arc::new(CivitaiClient::new(&self.config.registry)?),
        };

        let config = Arc::new(self.config);
        let store = Arc::new(HashStore::new(&config));
        let report = store.load().await;
        if !report.recovered.is_empty() {
            warn!(
                "Recovered {} corrupt store file(s) as empty maps",
                report.recovered.len()
            );
        }
        info!(
            "Model cache ready at {}: {} files, {} info entries",
            config.data_dir.display(),
            report.files,
            report.infos
        );

        let resolver = Resolver::new(
            store.clone(),
            lookup,
            RetryConfig::from(&config.registry),
            config.registry.max_concurrent,
            config.metadata_max_age(),
        );
        let scanner = Scanner::new(store.clone(), config.clone(), resolver.clone());

        Ok(ModelCache {
            inner: Arc::new(CacheInner {
                config,
                store,
                resolver,
                scanner,
                tracker: Arc::new(ScanProgressTracker::new()),
                active: std::sync::Mutex::new(None),
            }),
        })
    }
}
