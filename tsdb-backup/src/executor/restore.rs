//! Restore executor - replays merged backup manifests against a server.

use crate::api::model::BucketMetadataManifest;
use crate::api::{server_is_legacy, RestoreApi, UploadReader};
use crate::manifest::{read_manifests, BucketEntry, FileCompression, FileEntry, Manifest};
use crate::transfer::compression::{open_gzipped, open_plain};
use crate::transfer::progress::TransferStats;
use crate::utils::{BackupError, Result, ResultExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What to restore and from where.
#[derive(Debug, Clone, Default)]
pub struct RestoreParams {
    pub path: PathBuf,
    /// Replace all server state with the backup.
    pub full: bool,
    pub org_id: String,
    pub org: String,
    pub bucket_id: String,
    pub bucket: String,
    pub new_org_name: String,
    pub new_bucket_name: String,
}

impl RestoreParams {
    pub fn validate(&self) -> Result<()> {
        let has_org_filter = !self.org_id.is_empty() || !self.org.is_empty();
        let has_bucket_filter = !self.bucket_id.is_empty() || !self.bucket.is_empty();

        if self.full
            && (has_org_filter
                || has_bucket_filter
                || !self.new_org_name.is_empty()
                || !self.new_bucket_name.is_empty())
        {
            return Err(BackupError::InvalidArgument(
                "--full cannot be combined with org/bucket filters or new names".to_string(),
            ));
        }
        if !self.new_org_name.is_empty() && !has_org_filter {
            return Err(BackupError::InvalidArgument(
                "--new-org requires --org or --org-id".to_string(),
            ));
        }
        if !self.new_bucket_name.is_empty() && !has_bucket_filter {
            return Err(BackupError::InvalidArgument(
                "--new-bucket requires --bucket or --bucket-id".to_string(),
            ));
        }
        Ok(())
    }

    fn matches(&self, bucket: &BucketEntry) -> bool {
        let check = |filter: &str, value: &str| filter.is_empty() || filter == value;
        check(&self.org_id, &bucket.organization_id)
            && check(&self.org, &bucket.organization_name)
            && check(&self.bucket_id, &bucket.bucket_id)
            && check(&self.bucket, &bucket.bucket_name)
    }
}

#[derive(Debug)]
pub struct RestoreResult {
    /// The merged manifest the restore was driven by.
    pub manifest: Manifest,
    pub buckets_restored: usize,
    pub stats: TransferStats,
}

pub struct RestoreExecutor<'a, A: RestoreApi + ?Sized> {
    api: &'a A,
}

impl<'a, A: RestoreApi + ?Sized> RestoreExecutor<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self { api }
    }

    pub async fn execute(&self, params: &RestoreParams) -> Result<RestoreResult> {
        params.validate()?;

        let manifest = read_manifests(&params.path).await?;
        let legacy = server_is_legacy(self.api).await?;
        let mut stats = TransferStats::new();

        let buckets_restored = if params.full {
            self.restore_full(&params.path, &manifest, legacy, &mut stats)
                .await?;
            manifest.buckets.len()
        } else {
            self.restore_partial(params, &manifest, legacy, &mut stats)
                .await?
        };

        info!("Restore complete: {} from {:?}", stats.summary(), params.path);
        Ok(RestoreResult {
            manifest,
            buckets_restored,
            stats,
        })
    }

    async fn restore_full(
        &self,
        dir: &Path,
        manifest: &Manifest,
        legacy: bool,
        stats: &mut TransferStats,
    ) -> Result<()> {
        if legacy && manifest.sql.is_some() {
            return Err(BackupError::InvalidArgument(
                "backup contains SQL metadata, which cannot be restored to an InfluxDB 2.0.x server"
                    .to_string(),
            ));
        }

        info!("Restoring KV snapshot from {}", manifest.kv.file_name);
        let (body, encoding) = open_for_upload(dir, &manifest.kv, legacy).await?;
        let response = self
            .api
            .push_kv_snapshot(body, encoding)
            .await
            .context("failed to restore KV snapshot")?;
        if response.token.is_some() {
            warn!("Restored KV snapshot carries a different operator token; using it for the rest of the restore");
        }
        stats.record(manifest.kv.size as u64);

        if let Some(sql) = &manifest.sql {
            info!("Restoring SQL snapshot from {}", sql.file_name);
            let (body, encoding) = open_for_upload(dir, sql, legacy).await?;
            self.api
                .push_sql_snapshot(body, encoding)
                .await
                .context("failed to restore SQL snapshot")?;
            stats.record(sql.size as u64);
        }

        for shard in manifest.shards() {
            self.upload_shard(dir, shard.id, &shard.file, legacy).await?;
            stats.record(shard.file.size as u64);
        }
        Ok(())
    }

    async fn restore_partial(
        &self,
        params: &RestoreParams,
        manifest: &Manifest,
        legacy: bool,
        stats: &mut TransferStats,
    ) -> Result<usize> {
        let mut org_ids: HashMap<String, String> = HashMap::new();
        let mut restored = 0;

        for bucket in &manifest.buckets {
            if bucket.bucket_name.starts_with('_') {
                debug!("Skipping system bucket {:?}", bucket.bucket_name);
                continue;
            }
            if !params.matches(bucket) {
                continue;
            }

            let org_name = if params.new_org_name.is_empty() {
                bucket.organization_name.clone()
            } else {
                params.new_org_name.clone()
            };
            let org_id = match org_ids.get(&org_name) {
                Some(id) => id.clone(),
                None => {
                    let id = self
                        .api
                        .find_or_create_org(&org_name)
                        .await
                        .with_context(|| format!("failed to find or create org {:?}", org_name))?;
                    org_ids.insert(org_name.clone(), id.clone());
                    id
                }
            };

            let mut metadata = BucketMetadataManifest::from(bucket);
            metadata.organization_id = org_id;
            metadata.organization_name = org_name;
            if !params.new_bucket_name.is_empty() {
                metadata.bucket_name = params.new_bucket_name.clone();
            }

            info!(
                "Restoring bucket {:?} as {:?} in org {:?}",
                bucket.bucket_name, metadata.bucket_name, metadata.organization_name
            );
            let mappings = if legacy {
                self.api.restore_bucket_legacy(&metadata)
            } else {
                self.api.restore_bucket_metadata(&metadata)
            }
            .await
            .with_context(|| format!("failed to restore bucket {:?}", bucket.bucket_name))?;
            let new_ids: HashMap<i64, i64> = mappings
                .shard_mappings
                .iter()
                .map(|m| (m.old_id, m.new_id))
                .collect();

            for shard in bucket.shards() {
                let Some(&new_id) = new_ids.get(&shard.id) else {
                    warn!(
                        "Server assigned no new ID to shard {} of bucket {:?}, skipping",
                        shard.id, bucket.bucket_name
                    );
                    continue;
                };
                self.upload_shard(&params.path, new_id, &shard.file, legacy)
                    .await?;
                stats.record(shard.file.size as u64);
            }
            restored += 1;
        }

        if restored == 0 {
            warn!("No buckets in the backup matched the given filters");
        }
        Ok(restored)
    }

    async fn upload_shard(&self, dir: &Path, shard_id: i64, file: &FileEntry, legacy: bool) -> Result<()> {
        info!("Restoring TSM snapshot for shard {}", shard_id);
        let (body, encoding) = open_for_upload(dir, file, legacy).await?;
        self.api
            .push_shard_snapshot(shard_id, body, encoding)
            .await
            .with_context(|| format!("failed to restore TSM snapshot for shard {}", shard_id))
    }
}

/// Open an archived file the way the target server accepts it: gzipped for
/// current servers, plain for 2.0.x.
async fn open_for_upload(dir: &Path, file: &FileEntry, legacy: bool) -> Result<(UploadReader, FileCompression)> {
    let path = dir.join(&file.file_name);
    if legacy {
        Ok((open_plain(&path, file.compression).await?, FileCompression::None))
    } else {
        Ok((open_gzipped(&path, file.compression).await?, FileCompression::Gzip))
    }
}
