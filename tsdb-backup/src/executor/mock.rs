//! In-memory server used by executor tests.

use crate::api::model::{BucketMetadataManifest, BucketShardMapping, RestoredBucketMappings};
use crate::api::{
    ApiError, BackupApi, ErrorCode, HealthApi, KvRestoreResponse, RestoreApi, SnapshotResponse,
    UploadReader,
};
use crate::manifest::FileCompression;
use crate::utils::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;

pub const BOUNDARY: &str = "a1b2c3d4";

/// Build a `multipart/mixed` body the way the server frames metadata snapshots.
pub fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, data) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: attachment; name=\"{}\"\r\n", name).as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Kv,
    Sql,
    Shard(i64),
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub target: UploadTarget,
    pub encoding: FileCompression,
    pub body: Vec<u8>,
}

#[derive(Default)]
pub struct MockApi {
    pub version: Option<String>,
    /// Metadata snapshot body with its transport encoding.
    pub metadata: Option<(FileCompression, Vec<u8>)>,
    pub content_type: Option<String>,
    pub legacy_kv: Option<Vec<u8>>,
    pub shards: HashMap<i64, (FileCompression, Vec<u8>)>,
    /// Shards that fail with a server error instead of "not found".
    pub broken_shards: HashSet<i64>,
    /// Shards the server drops when restoring bucket metadata.
    pub unmapped_shards: HashSet<i64>,
    pub restored_token: Option<String>,
    pub orgs: Mutex<HashMap<String, String>>,

    pub uploads: Mutex<Vec<Upload>>,
    pub restored_buckets: Mutex<Vec<BucketMetadataManifest>>,
    /// Names of buckets created through the 2.0.x bucket APIs.
    pub legacy_buckets: Mutex<Vec<String>>,
    pub created_orgs: Mutex<Vec<String>>,
    pub shard_requests: Mutex<Vec<i64>>,
}

impl MockApi {
    pub fn with_version(version: &str) -> Self {
        Self {
            version: Some(version.to_string()),
            ..Default::default()
        }
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    async fn record(&self, target: UploadTarget, mut body: UploadReader, encoding: FileCompression) -> Result<()> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        self.uploads.lock().unwrap().push(Upload {
            target,
            encoding,
            body: data,
        });
        Ok(())
    }
}

fn snapshot(encoding: FileCompression, body: Vec<u8>, content_type: Option<String>) -> SnapshotResponse {
    SnapshotResponse {
        content_type,
        encoding,
        body: Box::pin(std::io::Cursor::new(body)),
    }
}

#[async_trait]
impl HealthApi for MockApi {
    async fn server_version(&self) -> Result<Option<String>> {
        Ok(self.version.clone())
    }
}

#[async_trait]
impl BackupApi for MockApi {
    async fn fetch_metadata_snapshot(&self) -> Result<SnapshotResponse> {
        let (encoding, body) = self
            .metadata
            .clone()
            .ok_or_else(|| ApiError::not_found("no metadata"))?;
        let content_type = self
            .content_type
            .clone()
            .or_else(|| Some(format!("multipart/mixed; boundary={}", BOUNDARY)));
        Ok(snapshot(encoding, body, content_type))
    }

    async fn fetch_kv_snapshot(&self) -> Result<SnapshotResponse> {
        let body = self
            .legacy_kv
            .clone()
            .ok_or_else(|| ApiError::not_found("no kv"))?;
        Ok(snapshot(FileCompression::None, body, None))
    }

    async fn fetch_shard_snapshot(&self, shard_id: i64) -> Result<SnapshotResponse> {
        self.shard_requests.lock().unwrap().push(shard_id);
        if self.broken_shards.contains(&shard_id) {
            return Err(ApiError::new(ErrorCode::Internal, "disk on fire").into());
        }
        let (encoding, body) = self
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("shard {} not found", shard_id)))?;
        Ok(snapshot(encoding, body, None))
    }
}

#[async_trait]
impl RestoreApi for MockApi {
    async fn push_kv_snapshot(
        &self,
        body: UploadReader,
        encoding: FileCompression,
    ) -> Result<KvRestoreResponse> {
        self.record(UploadTarget::Kv, body, encoding).await?;
        Ok(KvRestoreResponse {
            token: self.restored_token.clone(),
        })
    }

    async fn push_sql_snapshot(&self, body: UploadReader, encoding: FileCompression) -> Result<()> {
        self.record(UploadTarget::Sql, body, encoding).await
    }

    async fn push_shard_snapshot(
        &self,
        shard_id: i64,
        body: UploadReader,
        encoding: FileCompression,
    ) -> Result<()> {
        self.record(UploadTarget::Shard(shard_id), body, encoding).await
    }

    async fn restore_bucket_metadata(
        &self,
        bucket: &BucketMetadataManifest,
    ) -> Result<RestoredBucketMappings> {
        self.restored_buckets.lock().unwrap().push(bucket.clone());
        let shard_mappings = bucket
            .retention_policies
            .iter()
            .flat_map(|rp| rp.shard_groups.iter())
            .flat_map(|sg| sg.shards.iter())
            .filter(|s| !self.unmapped_shards.contains(&s.id))
            .map(|s| BucketShardMapping {
                old_id: s.id,
                new_id: s.id + 100,
            })
            .collect();
        Ok(RestoredBucketMappings {
            id: format!("new-{}", bucket.bucket_id),
            name: bucket.bucket_name.clone(),
            shard_mappings,
        })
    }

    async fn restore_bucket_legacy(
        &self,
        bucket: &BucketMetadataManifest,
    ) -> Result<RestoredBucketMappings> {
        let mappings = self.restore_bucket_metadata(bucket).await?;
        self.legacy_buckets.lock().unwrap().push(bucket.bucket_name.clone());
        Ok(mappings)
    }

    async fn find_or_create_org(&self, name: &str) -> Result<String> {
        let mut orgs = self.orgs.lock().unwrap();
        if let Some(id) = orgs.get(name) {
            return Ok(id.clone());
        }
        let id = format!("org-{}", orgs.len() + 1);
        orgs.insert(name.to_string(), id.clone());
        self.created_orgs.lock().unwrap().push(name.to_string());
        Ok(id)
    }
}
