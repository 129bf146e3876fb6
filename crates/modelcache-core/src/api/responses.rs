//! Response types returned by the cache facade.
//!
//! All of them serialize with camelCase field names so a route layer can
//! emit them as-is.

use crate::registry::ResolveOutcome;
use crate::store::ModelInfo;
use serde::Serialize;
use std::path::PathBuf;

/// Index-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_files: usize,
    pub total_info: usize,
    pub found_on_registry: usize,
    pub not_found_on_registry: usize,
    /// Distinct file hashes still waiting for registry metadata.
    pub pending: usize,
    pub storage_locations: Vec<PathBuf>,
}

/// Everything known about one hash.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashLookup {
    pub hash: String,
    pub info: Option<ModelInfo>,
    pub paths: Vec<String>,
}

/// Everything known about one path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathLookup {
    pub path: String,
    pub hash: String,
    pub info: Option<ModelInfo>,
    /// Other indexed paths with the same content.
    pub sibling_paths: Vec<String>,
}

/// Result of an explicit metadata pull.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    pub hash: String,
    /// Set when the pull was requested by path.
    pub path: Option<String>,
    /// Whether the file had to be hashed first.
    pub hashed: bool,
    pub outcome: ResolveOutcome,
    pub info: Option<ModelInfo>,
}
