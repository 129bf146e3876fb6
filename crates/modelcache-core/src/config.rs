//! Configuration for the model cache.
//!
//! Constant tables hold filenames and defaults; [`CacheConfig`] is the
//! serde-backed runtime configuration, loadable from a JSON file.

use crate::error::{CacheError, Result};
use crate::store::atomic_read_json;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted-state filenames inside the data directory.
pub struct PathsConfig;

impl PathsConfig {
    pub const APP_DIR_NAME: &'static str = "modelcache";
    pub const HASHES_FILENAME: &'static str = "hashes.json";
    pub const MODEL_INFO_FILENAME: &'static str = "model_info.json";
    pub const SIGNATURES_FILENAME: &'static str = "file_signatures.json";
    pub const CONFIG_FILENAME: &'static str = "config.json";
}

/// Registry defaults.
pub struct RegistryDefaults;

impl RegistryDefaults {
    pub const BASE_URL: &'static str = "https://civitai.com/api/v1";
    pub const API_KEY_ENV: &'static str = "CIVITAI_API_KEY";
    pub const USER_AGENT: &'static str = "modelcache/0.3";
    pub const REQUESTS_PER_WINDOW: u32 = 10;
    pub const WINDOW_SECS: u64 = 1;
    pub const MAX_CONCURRENT: usize = 4;
    pub const TIMEOUT_SECS: u64 = 30;
    pub const MAX_ATTEMPTS: u32 = 4;
    pub const BASE_DELAY_MS: u64 = 1_000;
    pub const MAX_DELAY_MS: u64 = 30_000;
}

/// Scanner defaults.
pub struct ScanDefaults;

impl ScanDefaults {
    pub const EXTENSIONS: &'static [&'static str] =
        &["safetensors", "ckpt", "pt", "pth", "bin", "gguf"];
    pub const SAVE_EVERY: usize = 25;
    pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;
}

/// Top-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Directory holding the persisted maps.
    pub data_dir: PathBuf,
    /// Configured model storage locations (default scan roots).
    pub model_roots: Vec<PathBuf>,
    /// Recognized model file extensions, without the dot.
    pub extensions: Vec<String>,
    /// Number of files hashed concurrently.
    pub hash_workers: usize,
    /// Save the store every N processed files during a scan.
    pub save_every: usize,
    /// Found entries older than this many days are re-queried by scans.
    pub metadata_max_age_days: Option<u64>,
    pub registry: RegistryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(PathsConfig::APP_DIR_NAME);
        Self {
            data_dir,
            model_roots: Vec::new(),
            extensions: ScanDefaults::EXTENSIONS
                .iter()
                .map(|e| (*e).to_string())
                .collect(),
            hash_workers: std::thread::available_parallelism()
                .map(|n| n.get().min(4))
                .unwrap_or(2),
            save_every: ScanDefaults::SAVE_EVERY,
            metadata_max_age_days: None,
            registry: RegistryConfig::default(),
        }
    }
}

/// Remote registry client configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub base_url: String,
    /// Bearer credential passed through to the registry.
    pub api_key: Option<String>,
    /// Token bucket size: requests allowed per window.
    pub requests_per_window: u32,
    pub window_secs: u64,
    /// Concurrent in-flight lookups.
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    /// Attempts per lookup, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl std::fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("base_url", &self.base_url)
            .field("has_api_key", &self.api_key.is_some())
            .field("requests_per_window", &self.requests_per_window)
            .field("window_secs", &self.window_secs)
            .field("max_concurrent", &self.max_concurrent)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: RegistryDefaults::BASE_URL.to_string(),
            api_key: None,
            requests_per_window: RegistryDefaults::REQUESTS_PER_WINDOW,
            window_secs: RegistryDefaults::WINDOW_SECS,
            max_concurrent: RegistryDefaults::MAX_CONCURRENT,
            timeout_secs: RegistryDefaults::TIMEOUT_SECS,
            max_attempts: RegistryDefaults::MAX_ATTEMPTS,
            base_delay_ms: RegistryDefaults::BASE_DELAY_MS,
            max_delay_ms: RegistryDefaults::MAX_DELAY_MS,
            jitter: true,
        }
    }
}

impl RegistryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CacheConfig {
    /// Create a configuration rooted at `data_dir` with default settings.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults. The `CIVITAI_API_KEY` environment
    /// variable, when set, overrides the configured key.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: CacheConfig = atomic_read_json(path)?.unwrap_or_default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(RegistryDefaults::API_KEY_ENV) {
            let key = key.trim();
            if !key.is_empty() {
                self.registry.api_key = Some(key.to_string());
            }
        }
    }

    /// Check the configuration for values the cache cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(CacheError::Config {
                message: "dataDir must not be empty".to_string(),
            });
        }
        if self.hash_workers == 0 {
            return Err(CacheError::Config {
                message: "hashWorkers must be at least 1".to_string(),
            });
        }
        if self.extensions.is_empty() {
            return Err(CacheError::Config {
                message: "extensions must list at least one file extension".to_string(),
            });
        }

        let registry = &self.registry;
        let parsed = url::Url::parse(&registry.base_url).map_err(|e| CacheError::Config {
            message: format!("Invalid registry baseUrl {}: {}", registry.base_url, e),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CacheError::Config {
                message: format!("Registry baseUrl must be http(s): {}", registry.base_url),
            });
        }
        if registry.requests_per_window == 0 || registry.window_secs == 0 {
            return Err(CacheError::Config {
                message: "Registry rate limit must allow at least one request per window"
                    .to_string(),
            });
        }
        if registry.max_concurrent == 0 || registry.max_attempts == 0 {
            return Err(CacheError::Config {
                message: "Registry maxConcurrent and maxAttempts must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Path of one persisted map inside the data directory.
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    /// Whether `path` carries a recognized model extension (case-insensitive).
    pub fn is_model_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.extensions
                    .iter()
                    .any(|known| known.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    pub fn metadata_max_age(&self) -> Option<chrono::Duration> {
        self.metadata_max_age_days
            .and_then(|days| chrono::Duration::try_days(days as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::with_data_dir("/tmp/modelcache");
        assert!(config.validate().is_ok());
        assert!(config.hash_workers >= 1);
        assert_eq!(config.registry.base_url, RegistryDefaults::BASE_URL);
    }

    #[test]
    fn test_is_model_file() {
        let config = CacheConfig::with_data_dir("/tmp/modelcache");
        assert!(config.is_model_file(Path::new("/models/a.safetensors")));
        assert!(config.is_model_file(Path::new("/models/B.CKPT")));
        assert!(!config.is_model_file(Path::new("/models/preview.png")));
        assert!(!config.is_model_file(Path::new("/models/noext")));
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(PathsConfig::CONFIG_FILENAME);
        std::fs::write(
            &path,
            r#"{"dataDir": "/srv/cache", "registry": {"requestsPerWindow": 2}}"#,
        )
        .unwrap();

        let config = CacheConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/cache"));
        assert_eq!(config.registry.requests_per_window, 2);
        assert_eq!(config.registry.max_attempts, RegistryDefaults::MAX_ATTEMPTS);
        assert_eq!(config.save_every, ScanDefaults::SAVE_EVERY);
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut config = CacheConfig::with_data_dir("/tmp/modelcache");
        config.registry.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        config.registry.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = CacheConfig::with_data_dir("/tmp/modelcache");
        config.hash_workers = 0;
        assert!(matches!(config.validate(), Err(CacheError::Config { .. })));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let mut config = RegistryConfig::default();
        config.api_key = Some("secret-token".to_string());
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("has_api_key: true"));
    }
}
