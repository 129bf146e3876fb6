//! Crash-safe JSON files for the persisted maps.
//!
//! A write stages the new content in a sibling temp file (pid and sequence
//! suffix), fsyncs it and renames it over the target.

use crate::error::{CacheError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Read one persisted map.
///
/// `Ok(None)` when the file does not exist yet. A file that exists but does
/// not parse is a `Json` error so the caller can quarantine it.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io_with_path(e, path)),
    };

    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| CacheError::Json {
            message: format!("{} is not valid JSON: {}", path.display(), e),
            source: Some(e),
        })
}

/// Replace `path` with the JSON rendering of `data`.
///
/// Readers see either the old file or the new one, never a partial write.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(data)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CacheError::io_with_path(e, parent))?;
    }

    let temp_path = temp_path_for(path);
    let staged = write_synced(&temp_path, &serialized)
        .and_then(|()| fs::rename(&temp_path, path))
        .map_err(|e| CacheError::io_with_path(e, path));
    if staged.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    staged?;

    debug!("Wrote {} ({} bytes)", path.display(), serialized.len());
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Move an unparseable file aside so the next save does not destroy it.
///
/// Returns the quarantine path on success. Failure is logged, not returned.
pub fn quarantine_corrupt(path: &Path) -> Option<PathBuf> {
    let mut name = path.file_name()?.to_os_string();
    name.push(".corrupt");
    let target = path.with_file_name(name);
    match fs::rename(path, &target) {
        Ok(()) => Some(target),
        Err(e) => {
            warn!("Failed to quarantine corrupt file {}: {}", path.display(), e);
            None
        }
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}.tmp", process::id(), seq));
    path.with_file_name(name)
}
