//! Persisted record types: file signatures, file records and model info.

use crate::error::{CacheError, Result};
use crate::registry::RemoteModel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::Metadata;
use std::time::UNIX_EPOCH;

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

/// Validate and canonicalize a content hash to lowercase hex SHA-256.
pub fn normalize_hash(hash: &str) -> Result<String> {
    let trimmed = hash.trim();
    if trimmed.is_empty() {
        return Err(CacheError::invalid("hash", "must not be empty"));
    }
    if trimmed.len() != SHA256_HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CacheError::invalid(
            "hash",
            format!("expected {} hex characters, got {:?}", SHA256_HEX_LEN, trimmed),
        ));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Whether `s` looks like a SHA-256 hex digest (any case).
pub fn looks_like_hash(s: &str) -> bool {
    normalize_hash(s).is_ok()
}

/// Size and modification time used to skip re-hashing unchanged files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSignature {
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub mtime_ms: i64,
}

impl FileSignature {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            size: metadata.len(),
            mtime_ms,
        }
    }
}

/// One indexed file: normalized path, content hash and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<FileSignature>,
}

/// Registry metadata for one content hash.
///
/// Promoted fields are typed for indexing and sorting; the registry payload is
/// kept verbatim in `raw`, and unknown keys (for example fields recorded by a
/// local metadata collaborator) survive a round-trip through `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub hash: String,
    #[serde(default)]
    pub civitai_found: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    /// When the registry last gave a definitive answer for this hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    /// Set to force the next normal scan to query the registry again.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelInfo {
    /// A definitive "not on the registry" entry.
    pub fn not_found(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            civitai_found: false,
            fetched_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// A locally created entry that still needs a registry lookup.
    pub fn local_placeholder(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            stale: true,
            ..Default::default()
        }
    }

    /// Whether a normal (non-forced) scan should query the registry again.
    ///
    /// Not-found answers are sticky: they only come back through `stale`.
    pub fn needs_refresh(&self, max_age: Option<chrono::Duration>, now: DateTime<Utc>) -> bool {
        if self.stale {
            return true;
        }
        match (self.civitai_found, max_age, self.fetched_at) {
            (true, Some(max_age), Some(fetched)) => now - fetched > max_age,
            (true, Some(_), None) => true,
            _ => false,
        }
    }

    /// Merge a successful registry answer.
    ///
    /// Remote-sourced fields are replaced wholesale; `last_used` and `extra`
    /// are left untouched.
    pub fn apply_remote(&mut self, remote: RemoteModel) {
        self.civitai_found = true;
        self.model_id = Some(remote.model_id);
        self.model_version_id = remote.model_version_id;
        self.name = remote.name;
        self.version_name = remote.version_name;
        self.base_model = remote.base_model;
        self.model_type = remote.model_type;
        self.raw = Some(remote.raw);
        self.fetched_at = Some(Utc::now());
        self.stale = false;
    }

    /// Merge a definitive not-found answer, clearing remote-sourced fields.
    pub fn apply_not_found(&mut self) {
        self.civitai_found = false;
        self.model_id = None;
        self.model_version_id = None;
        self.name = None;
        self.version_name = None;
        self.base_model = None;
        self.model_type = None;
        self.raw = None;
        self.fetched_at = Some(Utc::now());
        self.stale = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn remote(model_id: u64, name: &str) -> RemoteModel {
        RemoteModel {
            model_id,
            model_version_id: Some(model_id * 10),
            name: Some(name.to_string()),
            version_name: Some("v1".to_string()),
            base_model: Some("SDXL 1.0".to_string()),
            model_type: Some("LORA".to_string()),
            raw: json!({"id": model_id * 10, "modelId": model_id}),
        }
    }

    #[test]
    fn test_normalize_hash() {
        assert_eq!(normalize_hash(&HASH.to_uppercase()).unwrap(), HASH);
        assert_eq!(normalize_hash(&format!("  {}\n", HASH)).unwrap(), HASH);
        assert!(normalize_hash("").is_err());
        assert!(normalize_hash("abc123").is_err());
        assert!(normalize_hash(&HASH.replace('e', "z")).is_err());
    }

    #[test]
    fn test_apply_remote_preserves_local_fields() {
        let mut info = ModelInfo::local_placeholder(HASH);
        let used = Utc::now();
        info.last_used = Some(used);
        info.extra.insert("notes".to_string(), json!("favourite"));

        info.apply_remote(remote(42, "X"));

        assert!(info.civitai_found);
        assert_eq!(info.model_id, Some(42));
        assert_eq!(info.name.as_deref(), Some("X"));
        assert!(!info.stale);
        assert_eq!(info.last_used, Some(used));
        assert_eq!(info.extra.get("notes"), Some(&json!("favourite")));
    }

    #[test]
    fn test_apply_remote_overwrites_previous_remote_fields() {
        let mut info = ModelInfo::default();
        info.apply_remote(remote(1, "Old"));
        let mut newer = remote(2, "New");
        newer.base_model = None;
        info.apply_remote(newer);

        assert_eq!(info.model_id, Some(2));
        assert_eq!(info.name.as_deref(), Some("New"));
        assert_eq!(info.base_model, None);
    }

    #[test]
    fn test_apply_not_found_clears_remote_fields() {
        let mut info = ModelInfo::default();
        info.apply_remote(remote(7, "Gone"));
        info.last_used = Some(Utc::now());

        info.apply_not_found();

        assert!(!info.civitai_found);
        assert_eq!(info.model_id, None);
        assert_eq!(info.raw, None);
        assert!(info.last_used.is_some());
    }

    #[test]
    fn test_needs_refresh() {
        let now = Utc::now();
        let max_age = chrono::Duration::try_days(30);

        let not_found = ModelInfo::not_found(HASH);
        assert!(!not_found.needs_refresh(max_age, now));

        let mut found = ModelInfo::default();
        found.apply_remote(remote(1, "A"));
        assert!(!found.needs_refresh(max_age, now));
        assert!(!found.needs_refresh(None, now + chrono::Duration::try_days(365).unwrap()));
        assert!(found.needs_refresh(max_age, now + chrono::Duration::try_days(31).unwrap()));

        found.stale = true;
        assert!(found.needs_refresh(None, now));
    }

    #[test]
    fn test_unknown_keys_round_trip() {
        let value = json!({
            "hash": HASH,
            "civitaiFound": true,
            "modelId": 5,
            "nsfwLevel": 2,
            "trainedWords": ["foo"]
        });
        let info: ModelInfo = serde_json::from_value(value).unwrap();
        assert_eq!(info.model_id, Some(5));
        assert_eq!(info.extra.get("nsfwLevel"), Some(&json!(2)));

        let back = serde_json::to_value(&info).unwrap();
        assert_eq!(back["trainedWords"], json!(["foo"]));
        assert!(back.get("stale").is_none());
    }
}
