//! Reading manifests from an archive directory.
//!
//! Handles both the current format and the unversioned manifests written by
//! 2.0.x-era tooling, and merges every manifest in a directory into one.

use super::{
    convert_bucket_manifest, BucketEntry, FileCompression, FileEntry, Manifest, ShardFetch,
    ShardFetcher, MANIFEST_EXTENSION, MANIFEST_VERSION,
};
use crate::legacy::extract_bucket_metadata;
use crate::utils::{BackupError, Result, ResultExt};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Deserialize)]
struct ManifestVersion {
    #[serde(default, rename = "manifestVersion")]
    version: Option<i64>,
}

#[derive(Deserialize)]
struct LegacyManifest {
    kv: LegacyKvEntry,
    #[serde(default, rename = "files", deserialize_with = "crate::api::model::nullable")]
    shards: Vec<LegacyShardEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyKvEntry {
    file_name: String,
    size: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyShardEntry {
    #[serde(rename = "shardID")]
    shard_id: i64,
    file_name: String,
    size: i64,
}

/// Serves shard entries listed in a legacy manifest. Shards were always gzipped.
struct LegacyShardTable(HashMap<i64, FileEntry>);

#[async_trait]
impl ShardFetcher for LegacyShardTable {
    async fn fetch_shard(&self, shard_id: i64) -> Result<ShardFetch> {
        Ok(match self.0.get(&shard_id) {
            Some(entry) => ShardFetch::Found(entry.clone()),
            None => ShardFetch::NotFound,
        })
    }
}

/// Read one manifest, upgrading legacy manifests to the current format.
pub async fn read_manifest(path: &Path) -> Result<Manifest> {
    let buf = tokio::fs::read(path)
        .await
        .map_err(|e| BackupError::file(path, e))
        .with_context(|| format!("failed to read local manifest at {:?}", path))?;

    let header: ManifestVersion = serde_json::from_slice(&buf)
        .with_context(|| format!("failed to check version of local manifest at {:?}", path))?;

    match header.version.unwrap_or(0) {
        MANIFEST_VERSION => serde_json::from_slice(&buf)
            .with_context(|| format!("failed to parse manifest at {:?}", path)),
        0 => {
            let legacy: LegacyManifest = serde_json::from_slice(&buf)
                .with_context(|| format!("failed to parse legacy manifest at {:?}", path))?;
            convert_legacy(path, legacy).await
        }
        version => Err(BackupError::UnsupportedManifestVersion {
            version,
            path: path.to_path_buf(),
        }),
    }
}

async fn convert_legacy(path: &Path, legacy: LegacyManifest) -> Result<Manifest> {
    info!("Converting legacy manifest at {:?}", path);

    let kv_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&legacy.kv.file_name);
    let metadata = tokio::task::spawn_blocking(move || extract_bucket_metadata(&kv_path)).await??;

    let table = LegacyShardTable(
        legacy
            .shards
            .into_iter()
            .map(|s| {
                (
                    s.shard_id,
                    FileEntry {
                        file_name: s.file_name,
                        size: s.size,
                        compression: FileCompression::Gzip,
                    },
                )
            })
            .collect(),
    );

    let mut buckets = Vec::with_capacity(metadata.len());
    for bucket in metadata {
        let bucket_id = bucket.bucket_id.clone();
        let entry = convert_bucket_manifest(bucket, &table)
            .await
            .with_context(|| {
                format!(
                    "failed to parse entry for bucket {:?} in legacy manifest at {:?}",
                    bucket_id, path
                )
            })?;
        buckets.push(entry);
    }

    Ok(Manifest::new(
        FileEntry {
            file_name: legacy.kv.file_name,
            size: legacy.kv.size,
            compression: FileCompression::None,
        },
        None,
        buckets,
    ))
}

/// Manifest files directly inside `dir`, sorted by name.
pub async fn list_manifests(dir: &Path) -> Result<Vec<PathBuf>> {
    let dir_owned = dir.to_path_buf();
    let paths = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(&dir_owned)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir_owned.as_path()).to_path_buf();
                BackupError::file(path, e.into())
            })?;
            let is_manifest = entry
                .path()
                .extension()
                .is_some_and(|ext| ext == MANIFEST_EXTENSION);
            if is_manifest && !entry.file_type().is_dir() {
                paths.push(entry.into_path());
            }
        }
        Ok(paths)
    })
    .await??;

    Ok(paths)
}

/// Read every manifest in `dir` and merge them into one.
///
/// Manifests are applied in name order, so for the KV and SQL entries and for
/// each bucket ID the lexicographically last manifest wins.
pub async fn read_manifests(dir: &Path) -> Result<Manifest> {
    let paths = list_manifests(dir).await?;
    if paths.is_empty() {
        return Err(BackupError::NoBackupsFound(dir.to_path_buf()));
    }

    let mut manifests = Vec::with_capacity(paths.len());
    for path in &paths {
        debug!("Reading manifest {:?}", path);
        manifests.push(read_manifest(path).await?);
    }

    merge_manifests(manifests).ok_or_else(|| BackupError::NoBackupsFound(dir.to_path_buf()))
}

/// Fold manifests in order; later entries replace earlier ones.
pub fn merge_manifests(manifests: impl IntoIterator<Item = Manifest>) -> Option<Manifest> {
    let mut merged: Option<(FileEntry, Option<FileEntry>)> = None;
    let mut buckets: Vec<BucketEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for manifest in manifests {
        // KV and SQL snapshots are taken together, so both come from the same manifest.
        merged = Some((manifest.kv, manifest.sql));

        for bucket in manifest.buckets {
            match index.get(&bucket.bucket_id) {
                Some(&i) => buckets[i] = bucket,
                None => {
                    index.insert(bucket.bucket_id.clone(), buckets.len());
                    buckets.push(bucket);
                }
            }
        }
    }

    merged.map(|(kv, sql)| Manifest::new(kv, sql, buckets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::testing::{write_sample_kv, BUCKET_ID};
    use crate::manifest::{RetentionPolicyEntry, ShardGroupEntry};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn file(name: &str) -> FileEntry {
        FileEntry {
            file_name: name.to_string(),
            size: 1,
            compression: FileCompression::None,
        }
    }

    fn bucket(id: &str, name: &str) -> BucketEntry {
        BucketEntry {
            organization_id: "org-id".to_string(),
            organization_name: "org".to_string(),
            bucket_id: id.to_string(),
            bucket_name: name.to_string(),
            description: None,
            default_retention_policy: "autogen".to_string(),
            retention_policies: vec![RetentionPolicyEntry {
                name: "autogen".to_string(),
                replica_n: 1,
                duration: 0,
                shard_group_duration: 0,
                shard_groups: vec![ShardGroupEntry {
                    id: 1,
                    start_time: Utc.timestamp_opt(0, 0).unwrap(),
                    end_time: Utc.timestamp_opt(10, 0).unwrap(),
                    deleted_at: None,
                    truncated_at: None,
                    shards: vec![],
                }],
                subscriptions: vec![],
            }],
        }
    }

    fn write_manifest(dir: &Path, name: &str, manifest: &Manifest) {
        let json = serde_json::to_string_pretty(manifest).unwrap();
        std::fs::write(dir.join(name), json).unwrap();
    }

    #[tokio::test]
    async fn test_merge_later_manifest_wins_per_bucket() {
        let dir = TempDir::new().unwrap();
        let first = Manifest::new(
            file("a.bolt"),
            Some(file("a.sqlite")),
            vec![bucket("1", "one-old"), bucket("2", "two")],
        );
        let second = Manifest::new(
            file("b.bolt"),
            Some(file("b.sqlite")),
            vec![bucket("1", "one-new"), bucket("3", "three")],
        );
        // Written in reverse order so discovery order differs from creation order.
        write_manifest(dir.path(), "20220102T000000Z.manifest", &second);
        write_manifest(dir.path(), "20220101T000000Z.manifest", &first);

        let merged = read_manifests(dir.path()).await.unwrap();

        assert_eq!(merged.kv.file_name, "b.bolt");
        assert_eq!(merged.sql.unwrap().file_name, "b.sqlite");
        let mut names: Vec<(String, String)> = merged
            .buckets
            .iter()
            .map(|b| (b.bucket_id.clone(), b.bucket_name.clone()))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("1".to_string(), "one-new".to_string()),
                ("2".to_string(), "two".to_string()),
                ("3".to_string(), "three".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_directories_named_like_manifests_are_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("zzz.manifest")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        write_manifest(
            dir.path(),
            "20220101T000000Z.manifest",
            &Manifest::new(file("a.bolt"), None, vec![bucket("1", "one")]),
        );

        let paths = list_manifests(dir.path()).await.unwrap();
        assert_eq!(paths.len(), 1);

        let merged = read_manifests(dir.path()).await.unwrap();
        assert_eq!(merged.buckets.len(), 1);
        assert!(merged.sql.is_none());
    }

    #[tokio::test]
    async fn test_empty_directory_has_no_backups() {
        let dir = TempDir::new().unwrap();
        let err = read_manifests(dir.path()).await.unwrap_err();
        assert!(matches!(err, BackupError::NoBackupsFound(_)));
        assert!(err.to_string().contains("no backup manifests found"));
    }

    #[tokio::test]
    async fn test_unsupported_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.manifest");
        std::fs::write(&path, r#"{"manifestVersion": 3, "kv": {}}"#).unwrap();

        let err = read_manifest(&path).await.unwrap_err();
        match err {
            BackupError::UnsupportedManifestVersion { version, path: p } => {
                assert_eq!(version, 3);
                assert_eq!(p, path);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_current_version_round_trips() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(file("a.bolt"), Some(file("a.sqlite")), vec![bucket("1", "one")]);
        write_manifest(dir.path(), "a.manifest", &manifest);

        let read = read_manifest(&dir.path().join("a.manifest")).await.unwrap();
        assert_eq!(read, manifest);
    }

    #[tokio::test]
    async fn test_legacy_manifest_is_upgraded() {
        let dir = TempDir::new().unwrap();
        write_sample_kv(&dir.path().join("20201201T000000Z.bolt"));
        let legacy = serde_json::json!({
            "kv": {"fileName": "20201201T000000Z.bolt", "size": 8192},
            "files": [
                {"shardID": 10, "fileName": "20201201T000000Z.s10.tar.gz", "size": 512}
            ]
        });
        let path = dir.path().join("20201201T000000Z.manifest");
        std::fs::write(&path, legacy.to_string()).unwrap();

        let manifest = read_manifest(&path).await.unwrap();

        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.kv.compression, FileCompression::None);
        assert_eq!(manifest.kv.size, 8192);
        assert!(manifest.sql.is_none());
        assert_eq!(manifest.buckets.len(), 1);
        assert_eq!(manifest.buckets[0].bucket_id, BUCKET_ID);

        // Shard 11 is in the KV metadata but has no file, so it is dropped.
        let shards: Vec<_> = manifest.shards().collect();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].id, 10);
        assert_eq!(shards[0].file.compression, FileCompression::Gzip);
        assert_eq!(shards[0].file.file_name, "20201201T000000Z.s10.tar.gz");
    }

    #[tokio::test]
    async fn test_null_version_is_read_as_legacy() {
        let dir = TempDir::new().unwrap();
        write_sample_kv(&dir.path().join("kv.bolt"));
        let legacy = serde_json::json!({
            "manifestVersion": null,
            "kv": {"fileName": "kv.bolt", "size": 8192},
            "files": null
        });
        let path = dir.path().join("20201201T000000Z.manifest");
        std::fs::write(&path, legacy.to_string()).unwrap();

        let manifest = read_manifest(&path).await.unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert_eq!(manifest.buckets[0].bucket_id, BUCKET_ID);
        assert_eq!(manifest.shards().count(), 0);
    }
}
