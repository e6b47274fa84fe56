//! reqwest-based client for the server's HTTP API.

use super::model::{BucketMetadataManifest, BucketShardMapping, RestoredBucketMappings};
use super::{
    ApiError, BackupApi, HealthApi, KvRestoreResponse, RestoreApi, SnapshotResponse, UploadReader,
};
use crate::legacy::database_info;
use crate::manifest::FileCompression;
use crate::transfer::progress::format_bytes;
use crate::transfer::progress_stream::ProgressStream;
use crate::utils::{BackupError, Result, ResultExt};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use prost::Message;
use reqwest::header::{
    HeaderName, ACCEPT_ENCODING, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE,
};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct Organization {
    id: String,
}

#[derive(Deserialize)]
struct Organizations {
    #[serde(default, deserialize_with = "super::model::nullable")]
    orgs: Vec<Organization>,
}

#[derive(Deserialize)]
struct CreatedBucket {
    id: String,
}

const NANOS_PER_SECOND: i64 = 1_000_000_000;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetentionRule {
    #[serde(rename = "type")]
    kind: &'static str,
    every_seconds: i64,
    shard_group_duration_seconds: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PostBucketRequest<'a> {
    #[serde(rename = "orgID")]
    org_id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    retention_rules: Vec<RetentionRule>,
}

impl<'a> From<&'a BucketMetadataManifest> for PostBucketRequest<'a> {
    fn from(bucket: &'a BucketMetadataManifest) -> Self {
        PostBucketRequest {
            org_id: &bucket.organization_id,
            name: &bucket.bucket_name,
            description: bucket.description.as_deref(),
            retention_rules: bucket
                .retention_policies
                .iter()
                .map(|rp| RetentionRule {
                    kind: "expire",
                    every_seconds: rp.duration / NANOS_PER_SECOND,
                    shard_group_duration_seconds: rp.shard_group_duration / NANOS_PER_SECOND,
                })
                .collect(),
        }
    }
}

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpClient {
    /// `connect_timeout` bounds connection setup only; snapshot transfers may run for a long time.
    pub fn new(base_url: &str, token: Option<String>, connect_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        })
    }

    /// The token currently sent with each request.
    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match self.token.read().await.as_deref() {
            Some(token) => builder.header(AUTHORIZATION, format!("Token {}", token)),
            None => builder,
        }
    }

    /// Map unsuccessful responses to an [`ApiError`].
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.bytes().await.unwrap_or_default();
        Err(ApiError::from_response(status.as_u16(), &body).into())
    }

    async fn download(&self, path: &str, accept_gzip: bool) -> Result<SnapshotResponse> {
        let mut builder = self.request(Method::GET, path).await;
        if accept_gzip {
            builder = builder.header(ACCEPT_ENCODING, "gzip");
        }
        let response = Self::check(builder.send().await?).await?;

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let encoding = match header(CONTENT_ENCODING) {
            Some(enc) if enc.eq_ignore_ascii_case("gzip") => FileCompression::Gzip,
            _ => FileCompression::None,
        };

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(SnapshotResponse {
            content_type,
            encoding,
            body: Box::pin(StreamReader::new(stream)),
        })
    }

    async fn upload(
        &self,
        path: &str,
        body: UploadReader,
        encoding: FileCompression,
    ) -> Result<Response> {
        let label = path.to_string();
        let progress = Arc::new(move |bytes: u64| {
            debug!("{}: sent {}", label, format_bytes(bytes));
        });
        let stream = ProgressStream::new(ReaderStream::new(body), progress);
        let sent = stream.counter();

        let mut builder = self
            .request(Method::POST, path)
            .await
            .header(CONTENT_TYPE, "application/octet-stream");
        if encoding.is_gzip() {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }

        let response = builder
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        let response = Self::check(response).await?;
        debug!("Uploaded {} to {}", format_bytes(sent.load(Ordering::Relaxed)), path);
        Ok(response)
    }
}

#[async_trait]
impl HealthApi for HttpClient {
    async fn server_version(&self) -> Result<Option<String>> {
        let response = self.request(Method::GET, "/health").await.send().await?;
        let health: HealthResponse = Self::check(response).await?.json().await?;
        Ok(health.version)
    }
}

#[async_trait]
impl BackupApi for HttpClient {
    async fn fetch_metadata_snapshot(&self) -> Result<SnapshotResponse> {
        self.download("/api/v2/backup/metadata", true).await
    }

    async fn fetch_kv_snapshot(&self) -> Result<SnapshotResponse> {
        self.download("/api/v2/backup/kv", false).await
    }

    async fn fetch_shard_snapshot(&self, shard_id: i64) -> Result<SnapshotResponse> {
        self.download(&format!("/api/v2/backup/shards/{}", shard_id), true)
            .await
    }
}

#[async_trait]
impl RestoreApi for HttpClient {
    async fn push_kv_snapshot(
        &self,
        body: UploadReader,
        encoding: FileCompression,
    ) -> Result<KvRestoreResponse> {
        let response = self.upload("/api/v2/restore/kv", body, encoding).await?;
        let bytes = response.bytes().await?;
        let token = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice::<TokenResponse>(&bytes)?.token
        };

        let mut current = self.token.write().await;
        let token = token.filter(|t| !t.is_empty() && current.as_deref() != Some(t.as_str()));
        if let Some(new_token) = &token {
            info!("Switching to the operator token of the restored KV store");
            *current = Some(new_token.clone());
        }
        Ok(KvRestoreResponse { token })
    }

    async fn push_sql_snapshot(&self, body: UploadReader, encoding: FileCompression) -> Result<()> {
        self.upload("/api/v2/restore/sql", body, encoding).await?;
        Ok(())
    }

    async fn push_shard_snapshot(
        &self,
        shard_id: i64,
        body: UploadReader,
        encoding: FileCompression,
    ) -> Result<()> {
        self.upload(&format!("/api/v2/restore/shards/{}", shard_id), body, encoding)
            .await?;
        Ok(())
    }

    async fn restore_bucket_metadata(
        &self,
        bucket: &BucketMetadataManifest,
    ) -> Result<RestoredBucketMappings> {
        let response = self
            .request(Method::POST, "/api/v2/restore/bucket-metadata")
            .await
            .json(bucket)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn restore_bucket_legacy(
        &self,
        bucket: &BucketMetadataManifest,
    ) -> Result<RestoredBucketMappings> {
        let response = self
            .request(Method::POST, "/api/v2/buckets")
            .await
            .json(&PostBucketRequest::from(bucket))
            .send()
            .await?;
        let created: CreatedBucket = Self::check(response)
            .await
            .with_context(|| format!("couldn't create bucket {:?}", bucket.bucket_name))?
            .json()
            .await?;

        let response = self
            .request(Method::POST, &format!("/api/v2/restore/bucket/{}", created.id))
            .await
            .header(CONTENT_TYPE, "text/plain")
            .body(database_info(bucket).encode_to_vec())
            .send()
            .await?;
        let body = Self::check(response)
            .await
            .with_context(|| format!("couldn't restore database info for {:?}", bucket.bucket_name))?
            .bytes()
            .await?;

        let shard_map: HashMap<i64, i64> = serde_json::from_slice(&body).with_context(|| {
            format!(
                "couldn't parse result of restoring database info for {:?}",
                bucket.bucket_name
            )
        })?;
        let mut shard_mappings: Vec<BucketShardMapping> = shard_map
            .into_iter()
            .map(|(old_id, new_id)| BucketShardMapping { old_id, new_id })
            .collect();
        shard_mappings.sort_by_key(|m| m.old_id);

        Ok(RestoredBucketMappings {
            id: created.id,
            name: bucket.bucket_name.clone(),
            shard_mappings,
        })
    }

    async fn find_or_create_org(&self, name: &str) -> Result<String> {
        let response = self
            .request(Method::GET, "/api/v2/orgs")
            .await
            .query(&[("org", name)])
            .send()
            .await?;

        match Self::check(response).await {
            Ok(response) => {
                let found: Organizations = response.json().await?;
                if let Some(org) = found.orgs.into_iter().next() {
                    return Ok(org.id);
                }
            }
            Err(BackupError::Api(e)) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        info!("Creating organization {:?}", name);
        let response = self
            .request(Method::POST, "/api/v2/orgs")
            .await
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await?;
        let created: Organization = Self::check(response).await?.json().await?;
        Ok(created.id)
    }
}
