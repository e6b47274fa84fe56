//! Backup archive manifest.
//!
//! A manifest is the JSON index written next to the files of one backup run.
//! It lists the KV snapshot, the SQL snapshot and every captured shard along
//! with the bucket metadata needed to recreate them.

pub mod convert;
pub mod reader;

use crate::api::model::nullable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub use convert::{convert_bucket_manifest, ShardFetch, ShardFetcher};
pub use reader::{read_manifest, read_manifests};

/// Current manifest format version.
pub const MANIFEST_VERSION: i64 = 2;

/// Extension of manifest files inside an archive directory.
pub const MANIFEST_EXTENSION: &str = "manifest";

/// How a file is (or should be) compressed.
///
/// Used both for files stored in an archive and for HTTP transport encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileCompression {
    #[default]
    None,
    Gzip,
}

impl FileCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileCompression::None => "none",
            FileCompression::Gzip => "gzip",
        }
    }

    /// Suffix appended to archive file names, including the leading dot.
    pub fn suffix(&self) -> &'static str {
        match self {
            FileCompression::None => "",
            FileCompression::Gzip => ".gz",
        }
    }

    pub fn is_gzip(&self) -> bool {
        matches!(self, FileCompression::Gzip)
    }
}

impl fmt::Display for FileCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileCompression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(FileCompression::None),
            "gzip" => Ok(FileCompression::Gzip),
            other => Err(format!(
                "unsupported compression {:?}, expected \"none\" or \"gzip\"",
                other
            )),
        }
    }
}

impl Serialize for FileCompression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FileCompression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Older writers stored the enum ordinal.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Name(String),
            Ordinal(i64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
            Repr::Ordinal(0) => Ok(FileCompression::None),
            Repr::Ordinal(1) => Ok(FileCompression::Gzip),
            Repr::Ordinal(n) => Err(serde::de::Error::custom(format!(
                "unknown compression ordinal {}",
                n
            ))),
        }
    }
}

/// A file stored in the archive directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// Relative to the archive directory.
    pub file_name: String,
    /// On-disk length in bytes, after compression.
    pub size: i64,
    #[serde(default)]
    pub compression: FileCompression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "manifestVersion")]
    pub version: i64,
    pub kv: FileEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<FileEntry>,
    #[serde(default, deserialize_with = "nullable")]
    pub buckets: Vec<BucketEntry>,
}

impl Manifest {
    pub fn new(kv: FileEntry, sql: Option<FileEntry>, buckets: Vec<BucketEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            kv,
            sql,
            buckets,
        }
    }

    /// Every shard entry across all buckets, retention policies and shard groups.
    pub fn shards(&self) -> impl Iterator<Item = &ShardEntry> {
        self.buckets.iter().flat_map(BucketEntry::shards)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketEntry {
    #[serde(rename = "organizationID")]
    pub organization_id: String,
    pub organization_name: String,
    #[serde(rename = "bucketID")]
    pub bucket_id: String,
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub default_retention_policy: String,
    #[serde(default, deserialize_with = "nullable")]
    pub retention_policies: Vec<RetentionPolicyEntry>,
}

impl BucketEntry {
    pub fn shards(&self) -> impl Iterator<Item = &ShardEntry> {
        self.retention_policies
            .iter()
            .flat_map(|rp| rp.shard_groups.iter())
            .flat_map(|sg| sg.shards.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicyEntry {
    pub name: String,
    #[serde(default)]
    pub replica_n: i32,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub shard_group_duration: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub shard_groups: Vec<ShardGroupEntry>,
    #[serde(default, deserialize_with = "nullable")]
    pub subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardGroupEntry {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable")]
    pub shards: Vec<ShardEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardEntry {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub shard_owners: Vec<ShardOwnerEntry>,
    #[serde(flatten)]
    pub file: FileEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOwnerEntry {
    #[serde(rename = "nodeID")]
    pub node_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    pub name: String,
    pub mode: String,
    #[serde(default, deserialize_with = "nullable")]
    pub destinations: Vec<String>,
}
