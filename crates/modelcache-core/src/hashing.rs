//! Streaming SHA-256 hashing of model files.
//!
//! Files are read in fixed chunks so memory stays bounded regardless of file
//! size. The async entry point runs on the blocking pool.

use crate::config::ScanDefaults;
use crate::error::{CacheError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Compute the lowercase hex SHA-256 of a file's full contents.
pub fn compute_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| CacheError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ScanDefaults::CHUNK_SIZE];
    loop {
        let bytes_read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CacheError::io_with_path(e, path)),
        };
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file on the blocking pool.
pub async fn hash_file(path: impl Into<PathBuf>) -> Result<String> {
    let path = path.into();
    tokio::task::spawn_blocking(move || compute_sha256(&path))
        .await
        .map_err(|e| CacheError::Other(format!("Hash computation task failed: {}", e)))?
}
