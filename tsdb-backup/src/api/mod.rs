//! Server API used by backup and restore.
//!
//! The orchestrators talk to the server only through the traits defined
//! here; [`http::HttpClient`] is the production implementation.

pub mod error;
pub mod http;
pub mod model;

pub use error::{ApiError, ErrorCode};
pub use http::HttpClient;

use crate::manifest::FileCompression;
use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use model::{BucketMetadataManifest, RestoredBucketMappings};
use regex::Regex;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tracing::warn;

/// Streaming body of a download.
pub type DownloadReader = Pin<Box<dyn AsyncRead + Send>>;

/// Streaming body of an upload.
pub type UploadReader = Pin<Box<dyn AsyncRead + Send + Sync>>;

/// A snapshot streamed back by the server.
pub struct SnapshotResponse {
    pub content_type: Option<String>,
    /// Transport compression reported by the server (`Content-Encoding`).
    pub encoding: FileCompression,
    pub body: DownloadReader,
}

/// Reply to a KV restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvRestoreResponse {
    /// Operator token of the restored KV store, when it differs from the one in use.
    pub token: Option<String>,
}

#[async_trait]
pub trait HealthApi: Send + Sync {
    /// Version string reported by the health endpoint.
    async fn server_version(&self) -> Result<Option<String>>;
}

#[async_trait]
pub trait BackupApi: HealthApi {
    /// Multipart snapshot of the KV store, SQL store and bucket metadata.
    async fn fetch_metadata_snapshot(&self) -> Result<SnapshotResponse>;

    /// Raw KV store, as served by 2.0.x servers.
    async fn fetch_kv_snapshot(&self) -> Result<SnapshotResponse>;

    async fn fetch_shard_snapshot(&self, shard_id: i64) -> Result<SnapshotResponse>;
}

#[async_trait]
pub trait RestoreApi: HealthApi {
    async fn push_kv_snapshot(
        &self,
        body: UploadReader,
        encoding: FileCompression,
    ) -> Result<KvRestoreResponse>;

    async fn push_sql_snapshot(&self, body: UploadReader, encoding: FileCompression) -> Result<()>;

    async fn push_shard_snapshot(
        &self,
        shard_id: i64,
        body: UploadReader,
        encoding: FileCompression,
    ) -> Result<()>;

    /// Create a bucket from backed-up metadata; returns the new shard IDs.
    async fn restore_bucket_metadata(
        &self,
        bucket: &BucketMetadataManifest,
    ) -> Result<RestoredBucketMappings>;

    /// Create a bucket on a 2.0.x server, which lacks the bucket-metadata
    /// endpoint: the bucket is created first, then its shards are pre-created
    /// from the encoded v1 database info.
    async fn restore_bucket_legacy(
        &self,
        bucket: &BucketMetadataManifest,
    ) -> Result<RestoredBucketMappings>;

    /// ID of the organization named `name`, creating it if needed.
    async fn find_or_create_org(&self, name: &str) -> Result<String>;
}

/// Whether the server runs 2.0.x, which only offers the older snapshot APIs.
pub async fn server_is_legacy<A: HealthApi + ?Sized>(api: &A) -> Result<bool> {
    let version = api
        .server_version()
        .await
        .map_err(|e| e.context("API compatibility check failed"))?
        .unwrap_or_default();
    version_is_legacy(&version)
}

fn version_is_legacy(version: &str) -> Result<bool> {
    let semver = Regex::new(r"(\d+)\.(\d+)\.(\d+)")
        .map_err(|e| BackupError::Config(e.to_string()))?;

    let parsed = semver.captures(version).and_then(|caps| {
        let major = caps.get(1)?.as_str().parse::<u64>().ok()?;
        let minor = caps.get(2)?.as_str().parse::<u64>().ok()?;
        Some((major, minor))
    });

    let Some((major, minor)) = parsed else {
        // Nightlies and dev builds report non-semver versions and support the current APIs.
        warn!(
            "Couldn't parse version {:?} reported by server, assuming latest backup/restore APIs are supported",
            version
        );
        return Ok(false);
    };

    if major < 2 {
        return Err(BackupError::InvalidArgument(format!(
            "InfluxDB v{} does not support the APIs required for backup/restore",
            major
        )));
    }
    Ok(minor == 0)
}
