//! Command implementations.

use anyhow::{bail, Context, Result};
use modelcache_core::config::PathsConfig;
use modelcache_core::store::looks_like_hash;
use modelcache_core::{CacheConfig, ModelCache, ScanOptions, ScanStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Load the configuration file (explicit or default location) and apply the
/// data directory override.
pub fn resolve_config(
    config_path: Option<&Path>,
    data_dir: Option<PathBuf>,
) -> Result<CacheConfig> {
    let default_path;
    let path = match config_path {
        Some(path) => path,
        None => {
            default_path = CacheConfig::default().data_file(PathsConfig::CONFIG_FILENAME);
            default_path.as_path()
        }
    };

    let mut config = CacheConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    Ok(config)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Run a scan in the foreground, cancelling it on Ctrl-C.
pub async fn scan(cache: &ModelCache, roots: Vec<PathBuf>, options: ScanOptions) -> Result<()> {
    let job_id = cache.start_scan(roots, options).await?;
    info!("Scan {} started", job_id);

    let mut cancel_requested = false;
    let progress = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                warn!("Interrupt received, cancelling scan {}", job_id);
                cache.cancel_scan(&job_id)?;
                cancel_requested = true;
            }
            _ = tokio::time::sleep(PROGRESS_INTERVAL) => {
                let Some(progress) = cache.get_scan_progress(&job_id) else {
                    bail!("Scan {} disappeared", job_id);
                };
                if progress.status.is_terminal() {
                    break progress;
                }
                info!(
                    "{}/{} files, {} lookups pending",
                    progress.files_processed, progress.files_total, progress.lookups_pending
                );
            }
        }
    };

    print_json(&progress)?;
    if progress.status == ScanStatus::Failed {
        bail!(
            "Scan failed: {}",
            progress.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

/// Look up a hash or a path and print what the index knows.
pub async fn lookup(cache: &ModelCache, hash_or_path: &str) -> Result<()> {
    if looks_like_hash(hash_or_path) {
        print_json(&cache.get_by_hash(hash_or_path).await?)
    } else {
        print_json(&cache.get_by_path(hash_or_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_config_with_override() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{"dataDir": "/from/file", "saveEvery": 3}"#,
        )
        .unwrap();

        let config = resolve_config(Some(&config_path), None).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/from/file"));
        assert_eq!(config.save_every, 3);

        let overridden =
            resolve_config(Some(&config_path), Some(temp_dir.path().join("data"))).unwrap();
        assert_eq!(overridden.data_dir, temp_dir.path().join("data"));
    }

    #[test]
    fn test_resolve_config_rejects_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"hashWorkers": 0}"#).unwrap();

        assert!(resolve_config(Some(&config_path), None).is_err());
    }
}
