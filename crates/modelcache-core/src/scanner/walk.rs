//! Enumerate model files under scan roots.

use super::progress::FileFailure;
use crate::config::CacheConfig;
use crate::dedup::normalize_path;
use crate::error::{CacheError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Files found under the roots, keyed by normalized path.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// (normalized key, on-disk path), sorted by key, without duplicates.
    pub files: Vec<(String, PathBuf)>,
    /// Entries below a root that could not be read.
    pub failures: Vec<FileFailure>,
}

fn check_root(root: &Path) -> Result<()> {
    let unreadable = |message: String| CacheError::RootUnreadable {
        path: root.to_path_buf(),
        message,
    };
    let metadata = std::fs::metadata(root).map_err(|e| unreadable(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(unreadable("not a directory".to_string()));
    }
    std::fs::read_dir(root).map_err(|e| unreadable(e.to_string()))?;
    Ok(())
}

/// Walk every root and collect recognized model files.
///
/// A root that is missing, not a directory, or unreadable is a structural
/// error. Unreadable entries below a root are reported as failures.
pub fn collect_model_files(roots: &[PathBuf], config: &CacheConfig) -> Result<WalkOutcome> {
    for root in roots {
        check_root(root)?;
    }

    let mut files = BTreeMap::new();
    let mut failures = Vec::new();
    for root in roots {
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.depth() == 0 {
                        return Err(CacheError::RootUnreadable {
                            path: root.clone(),
                            message: e.to_string(),
                        });
                    }
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string());
                    debug!("Skipping unreadable entry {}: {}", path, e);
                    failures.push(FileFailure {
                        path,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() || !config.is_model_file(entry.path()) {
                continue;
            }
            let path = entry.into_path();
            files.entry(normalize_path(&path)).or_insert(path);
        }
    }

    Ok(WalkOutcome {
        files: files.into_iter().collect(),
        failures,
    })
}
