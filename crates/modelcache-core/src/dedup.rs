//! Deduplication engine: duplicate paths, ghost records and version groups.
//!
//! Everything here is a pure function over a [`StoreSnapshot`], except
//! [`find_ghosts`] which checks file existence. Nothing is ever removed.

use crate::store::{ModelInfo, StoreSnapshot};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

/// Paths that share one content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub hash: String,
    pub paths: Vec<String>,
    pub name: Option<String>,
}

/// An indexed path whose file no longer exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GhostEntry {
    pub path: String,
    pub hash: String,
    pub name: Option<String>,
}

/// All known versions of one registry model, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionGroup {
    pub model_id: u64,
    pub name: Option<String>,
    pub versions: Vec<ModelInfo>,
}

/// Canonical string key for a filesystem path.
///
/// Relative paths are resolved against the working directory, `.` and `..`
/// are folded lexically (no symlink resolution), separators become `/`, and
/// on case-insensitive platforms the result is lowercased.
pub fn normalize_path(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    cleaned.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    cleaned.pop();
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }

    let mut key = cleaned.to_string_lossy().replace('\\', "/");
    if key.len() > 1 && key.ends_with('/') {
        key.pop();
    }
    if cfg!(any(windows, target_os = "macos")) {
        key = key.to_lowercase();
    }
    key
}

fn model_name(info: &HashMap<String, ModelInfo>, hash: &str) -> Option<String> {
    info.get(hash).and_then(|i| i.name.clone())
}

/// Groups of distinct normalized paths sharing a hash, sorted by hash.
pub fn find_duplicates(snapshot: &StoreSnapshot) -> Vec<DuplicateGroup> {
    let mut by_hash: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for (path, hash) in &snapshot.hashes {
        by_hash
            .entry(hash.as_str())
            .or_default()
            .insert(normalize_path(Path::new(path)));
    }

    by_hash
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(hash, paths)| DuplicateGroup {
            hash: hash.to_string(),
            paths: paths.into_iter().collect(),
            name: model_name(&snapshot.info, hash),
        })
        .collect()
}

/// Records whose file is gone, sorted by path.
pub fn find_ghosts(snapshot: &StoreSnapshot) -> Vec<GhostEntry> {
    find_ghosts_with(snapshot, |path| path.exists())
}

/// [`find_ghosts`] with an injectable existence check.
pub fn find_ghosts_with(
    snapshot: &StoreSnapshot,
    exists: impl Fn(&Path) -> bool,
) -> Vec<GhostEntry> {
    let mut ghosts: Vec<GhostEntry> = snapshot
        .hashes
        .iter()
        .filter(|(path, _)| !exists(Path::new(path.as_str())))
        .map(|(path, hash)| GhostEntry {
            path: path.clone(),
            hash: hash.clone(),
            name: model_name(&snapshot.info, hash),
        })
        .collect();
    ghosts.sort_by(|a, b| a.path.cmp(&b.path));
    ghosts
}

fn recency_key(info: &ModelInfo) -> (Option<chrono::DateTime<chrono::Utc>>, Option<u64>) {
    (info.last_used, info.model_version_id)
}

/// Found entries grouped by `modelId`.
///
/// Entries are ordered newest first by `lastUsed`, then `modelVersionId`;
/// groups are ordered by their newest entry.
pub fn version_groups(snapshot: &StoreSnapshot) -> Vec<VersionGroup> {
    let mut by_model: HashMap<u64, Vec<ModelInfo>> = HashMap::new();
    for info in snapshot.info.values().filter(|i| i.civitai_found) {
        if let Some(model_id) = info.model_id {
            by_model.entry(model_id).or_default().push(info.clone());
        }
    }

    let mut groups: Vec<VersionGroup> = by_model
        .into_iter()
        .map(|(model_id, mut versions)| {
            versions.sort_by(|a, b| {
                recency_key(b)
                    .cmp(&recency_key(a))
                    .then_with(|| a.hash.cmp(&b.hash))
            });
            VersionGroup {
                model_id,
                name: versions.iter().find_map(|v| v.name.clone()),
                versions,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        let newest_a = a.versions.first().map(recency_key);
        let newest_b = b.versions.first().map(recency_key);
        newest_b
            .cmp(&newest_a)
            .then_with(|| a.model_id.cmp(&b.model_id))
    });
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn h(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn snapshot(files: &[(&str, String)]) -> StoreSnapshot {
        StoreSnapshot {
            hashes: files
                .iter()
                .map(|(p, h)| (p.to_string(), h.clone()))
                .collect(),
            info: HashMap::new(),
        }
    }

    fn found(hash: String, model_id: u64, version_id: u64, used_day: Option<u32>) -> ModelInfo {
        ModelInfo {
            hash,
            civitai_found: true,
            model_id: Some(model_id),
            model_version_id: Some(version_id),
            name: Some(format!("model-{}", model_id)),
            last_used: used_day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_normalize_path_lexical() {
        assert_eq!(normalize_path(Path::new("/models/./a/../b.ckpt")), "/models/b.ckpt");
        assert_eq!(normalize_path(Path::new("/../x")), "/x");
        assert_eq!(normalize_path(Path::new("/models/dir/")), "/models/dir");

        let relative = normalize_path(Path::new("rel/file.pt"));
        assert!(relative.starts_with('/'));
        assert!(relative.ends_with("rel/file.pt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_duplicates_need_two_distinct_paths() {
        let snap = snapshot(&[
            ("/m/a.safetensors", h('a')),
            ("/m/b.safetensors", h('a')),
            ("/m/sub/../c.safetensors", h('b')),
            ("/m/c.safetensors", h('b')),
            ("/m/d.safetensors", h('c')),
        ]);

        let groups = find_duplicates(&snap);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].hash, h('a'));
        assert_eq!(
            groups[0].paths,
            vec!["/m/a.safetensors".to_string(), "/m/b.safetensors".to_string()]
        );
    }

    #[test]
    fn test_ghosts_flagged_not_removed() {
        let mut snap = snapshot(&[("/m/gone.ckpt", h('a')), ("/m/here.ckpt", h('b'))]);
        snap.info.insert(h('a'), found(h('a'), 1, 10, None));

        let ghosts = find_ghosts_with(&snap, |p| p.ends_with("here.ckpt"));
        assert_eq!(ghosts.len(), 1);
        assert_eq!(ghosts[0].path, "/m/gone.ckpt");
        assert_eq!(ghosts[0].name.as_deref(), Some("model-1"));
        assert_eq!(snap.hashes.len(), 2);
    }

    #[test]
    fn test_version_groups_ordering() {
        let mut snap = StoreSnapshot::default();
        snap.info.insert(h('a'), found(h('a'), 1, 10, Some(1)));
        snap.info.insert(h('b'), found(h('b'), 1, 11, Some(5)));
        snap.info.insert(h('c'), found(h('c'), 1, 12, None));
        snap.info.insert(h('d'), found(h('d'), 2, 20, Some(9)));
        snap.info.insert(h('e'), ModelInfo::not_found(h('e')));

        let groups = version_groups(&snap);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].model_id, 2);
        let ids: Vec<_> = groups[1]
            .versions
            .iter()
            .map(|v| v.model_version_id.unwrap())
            .collect();
        assert_eq!(ids, vec![11, 10, 12]);
    }
}
