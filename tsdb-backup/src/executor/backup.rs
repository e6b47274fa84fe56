//! Backup executor - downloads metadata and shard snapshots into an archive directory.

use super::backup_base_name;
use crate::api::model::BucketMetadataManifest;
use crate::api::{server_is_legacy, BackupApi, DownloadReader, SnapshotResponse};
use crate::legacy::extract_bucket_metadata;
use crate::manifest::{
    convert_bucket_manifest, FileCompression, FileEntry, Manifest, ShardFetch, ShardFetcher,
    MANIFEST_EXTENSION,
};
use crate::transfer::compression::write_snapshot_file;
use crate::transfer::progress::{format_bytes, TransferStats};
use crate::utils::{BackupError, Result, ResultExt};
use async_compression::tokio::bufread::GzipDecoder;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::TryStreamExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::BufReader;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{info, warn};

/// What to back up and where.
#[derive(Debug, Clone, Default)]
pub struct BackupParams {
    pub path: PathBuf,
    /// Filters; an empty string matches everything.
    pub org_id: String,
    pub org: String,
    pub bucket_id: String,
    pub bucket: String,
    /// How files are stored in the archive directory.
    pub compression: FileCompression,
}

impl BackupParams {
    pub fn matches(&self, bucket: &BucketMetadataManifest) -> bool {
        let check = |filter: &str, value: &str| filter.is_empty() || filter == value;
        check(&self.org_id, &bucket.organization_id)
            && check(&self.org, &bucket.organization_name)
            && check(&self.bucket_id, &bucket.bucket_id)
            && check(&self.bucket, &bucket.bucket_name)
    }
}

#[derive(Debug)]
pub struct BackupResult {
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
    pub stats: TransferStats,
}

/// Snapshots captured by the metadata step.
struct MetadataSnapshot {
    kv: FileEntry,
    sql: Option<FileEntry>,
    buckets: Vec<BucketMetadataManifest>,
}

pub struct BackupExecutor<'a, A: BackupApi + ?Sized> {
    api: &'a A,
}

impl<'a, A: BackupApi + ?Sized> BackupExecutor<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self { api }
    }

    /// Back up into `params.path`, naming files after the current UTC time.
    pub async fn execute(&self, params: &BackupParams) -> Result<BackupResult> {
        self.execute_as(params, &backup_base_name(Utc::now())).await
    }

    /// Back up using `base_name` as the prefix of every written file.
    pub async fn execute_as(&self, params: &BackupParams, base_name: &str) -> Result<BackupResult> {
        tokio::fs::create_dir_all(&params.path)
            .await
            .map_err(|e| BackupError::file(&params.path, e))?;

        let mut stats = TransferStats::new();
        let legacy = server_is_legacy(self.api).await?;

        let metadata = if legacy {
            self.download_metadata_legacy(params, base_name).await
        } else {
            self.download_metadata(params, base_name).await
        }
        .context("failed to backup metadata")?;

        stats.record(metadata.kv.size as u64);
        if let Some(sql) = &metadata.sql {
            stats.record(sql.size as u64);
        }

        let downloader = ShardDownloader {
            api: self.api,
            dir: &params.path,
            base_name,
            compression: params.compression,
            stats: Mutex::new(stats),
        };

        let mut buckets = Vec::new();
        for bucket in metadata.buckets {
            if !params.matches(&bucket) {
                continue;
            }
            info!("Backing up bucket {:?} ({})", bucket.bucket_name, bucket.bucket_id);
            let entry = convert_bucket_manifest(bucket, &downloader)
                .await
                .context("failed to backup bucket data")?;
            buckets.push(entry);
        }
        let stats = downloader.into_stats();

        let manifest = Manifest::new(metadata.kv, metadata.sql, buckets);
        let manifest_path = params
            .path
            .join(format!("{}.{}", base_name, MANIFEST_EXTENSION));
        write_manifest(&manifest, &manifest_path)
            .await
            .context("failed to write backup manifest")?;

        info!("Backup complete: {} -> {:?}", stats.summary(), params.path);
        Ok(BackupResult {
            manifest_path,
            manifest,
            stats,
        })
    }

    async fn download_metadata(&self, params: &BackupParams, base_name: &str) -> Result<MetadataSnapshot> {
        info!("Downloading metadata snapshot");
        let snapshot = self
            .api
            .fetch_metadata_snapshot()
            .await
            .context("failed to download metadata snapshot")?;

        let content_type = snapshot.content_type.clone().unwrap_or_default();
        let boundary = multipart_boundary(&content_type).ok_or_else(|| {
            BackupError::Protocol(format!(
                "invalid content type {:?} for metadata snapshot",
                content_type
            ))
        })?;
        let body = gunzip_if_needed(snapshot);
        let mut parts = multer::Multipart::new(ReaderStream::new(body), boundary);

        let suffix = params.compression.suffix();
        let mut kv = None;
        let mut sql = None;
        let mut buckets = None;

        while let Some(field) = parts.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "kv" | "sql" => {
                    let ext = if name == "kv" { "bolt" } else { "sqlite" };
                    let file_name = format!("{}.{}{}", base_name, ext, suffix);
                    let reader = StreamReader::new(field.map_err(std::io::Error::other));
                    let entry = write_snapshot_file(
                        reader,
                        FileCompression::None,
                        params.compression,
                        &params.path.join(&file_name),
                    )
                    .await
                    .with_context(|| {
                        format!("failed to save local copy of {} backup to {:?}", name, file_name)
                    })?;
                    info!("Saved {} snapshot ({})", name, format_bytes(entry.size as u64));

                    if name == "kv" {
                        kv = Some(entry);
                    } else {
                        sql = Some(entry);
                    }
                }
                "buckets" => {
                    let bytes = field.bytes().await?;
                    let decoded: Vec<BucketMetadataManifest> = serde_json::from_slice(&bytes)
                        .context("failed to decode bucket manifest from backup")?;
                    buckets = Some(decoded);
                }
                other => {
                    return Err(BackupError::Protocol(format!(
                        "response contained unexpected part {:?}",
                        other
                    )));
                }
            }
        }

        let kv = kv.ok_or_else(|| {
            BackupError::Protocol("metadata snapshot did not contain a KV store".to_string())
        })?;
        Ok(MetadataSnapshot {
            kv,
            sql,
            buckets: buckets.unwrap_or_default(),
        })
    }

    async fn download_metadata_legacy(&self, params: &BackupParams, base_name: &str) -> Result<MetadataSnapshot> {
        info!("Downloading legacy KV snapshot");
        let snapshot = self
            .api
            .fetch_kv_snapshot()
            .await
            .context("failed to download KV snapshot")?;

        let tmp_path = params.path.join(format!("{}.bolt.tmp", base_name));
        let kv_path = params
            .path
            .join(format!("{}.bolt{}", base_name, params.compression.suffix()));

        let result = save_legacy_kv(snapshot, &tmp_path, &kv_path, params.compression).await;
        match tokio::fs::remove_file(&tmp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temporary KV snapshot {:?}: {}", tmp_path, e),
        }

        let (kv, buckets) = result?;
        Ok(MetadataSnapshot {
            kv,
            sql: None,
            buckets,
        })
    }
}

/// Boundary parameter of a `multipart/*` content type.
fn multipart_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let media_type = params.next()?.trim().to_ascii_lowercase();
    if !media_type.starts_with("multipart/") {
        return None;
    }
    params.find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn gunzip_if_needed(snapshot: SnapshotResponse) -> DownloadReader {
    if snapshot.encoding.is_gzip() {
        Box::pin(GzipDecoder::new(BufReader::new(snapshot.body)))
    } else {
        snapshot.body
    }
}

/// Download the raw KV store, read bucket metadata from it, then move it into place.
async fn save_legacy_kv(
    snapshot: SnapshotResponse,
    tmp_path: &Path,
    kv_path: &Path,
    compression: FileCompression,
) -> Result<(FileEntry, Vec<BucketMetadataManifest>)> {
    write_snapshot_file(snapshot.body, snapshot.encoding, FileCompression::None, tmp_path)
        .await
        .context("failed to save downloaded KV snapshot")?;

    let extract_from = tmp_path.to_path_buf();
    let buckets = tokio::task::spawn_blocking(move || extract_bucket_metadata(&extract_from))
        .await?
        .context("failed to extract bucket metadata from downloaded KV snapshot")?;

    let entry = match compression {
        FileCompression::None => {
            tokio::fs::rename(tmp_path, kv_path)
                .await
                .map_err(|e| BackupError::file(kv_path, e))
                .context("failed to rename downloaded KV snapshot")?;
            let size = tokio::fs::metadata(kv_path)
                .await
                .map_err(|e| BackupError::file(kv_path, e))?
                .len();
            FileEntry {
                file_name: file_name_of(kv_path),
                size: size as i64,
                compression,
            }
        }
        FileCompression::Gzip => {
            let tmp = tokio::fs::File::open(tmp_path)
                .await
                .map_err(|e| BackupError::file(tmp_path, e))?;
            write_snapshot_file(tmp, FileCompression::None, compression, kv_path)
                .await
                .context("failed to compress downloaded KV snapshot")?
        }
    };

    Ok((entry, buckets))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn write_manifest(manifest: &Manifest, path: &Path) -> Result<()> {
    let mut json = serde_json::to_string_pretty(manifest)?;
    json.push('\n');
    tokio::fs::write(path, json)
        .await
        .map_err(|e| BackupError::file(path, e))
}

/// Fetches shard snapshots into the archive directory during bucket conversion.
struct ShardDownloader<'a, A: BackupApi + ?Sized> {
    api: &'a A,
    dir: &'a Path,
    base_name: &'a str,
    compression: FileCompression,
    stats: Mutex<TransferStats>,
}

impl<'a, A: BackupApi + ?Sized> ShardDownloader<'a, A> {
    fn into_stats(self) -> TransferStats {
        self.stats
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl<'a, A: BackupApi + ?Sized> ShardFetcher for ShardDownloader<'a, A> {
    async fn fetch_shard(&self, shard_id: i64) -> Result<ShardFetch> {
        info!("Backing up TSM for shard {}", shard_id);
        let snapshot = match self.api.fetch_shard_snapshot(shard_id).await {
            Ok(snapshot) => snapshot,
            Err(BackupError::Api(e)) if e.is_not_found() => {
                warn!("Shard {} removed during backup", shard_id);
                return Ok(ShardFetch::NotFound);
            }
            Err(e) => return Err(e),
        };

        let path = self.dir.join(format!(
            "{}.{}.tar{}",
            self.base_name,
            shard_id,
            self.compression.suffix()
        ));
        let entry = write_snapshot_file(snapshot.body, snapshot.encoding, self.compression, &path).await?;

        if let Ok(mut stats) = self.stats.lock() {
            stats.record(entry.size as u64);
        }
        Ok(ShardFetch::Found(entry))
    }
}
