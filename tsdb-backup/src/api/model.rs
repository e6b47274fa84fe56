//! Wire-format types exchanged with the server's backup/restore endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a JSON `null` as the type's default value.
///
/// Servers written in Go encode empty slices as `null`.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Metadata for one bucket, as served in the `buckets` part of a metadata snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketMetadataManifest {
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
    pub retention_policies: Vec<RetentionPolicyManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicyManifest {
    pub name: String,
    #[serde(default)]
    pub replica_n: i32,
    /// Nanoseconds.
    #[serde(default)]
    pub duration: i64,
    /// Nanoseconds.
    #[serde(default)]
    pub shard_group_duration: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub shard_groups: Vec<ShardGroupManifest>,
    #[serde(default, deserialize_with = "nullable")]
    pub subscriptions: Vec<SubscriptionManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardGroupManifest {
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable")]
    pub shards: Vec<ShardManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardManifest {
    pub id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub shard_owners: Vec<ShardOwner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOwner {
    #[serde(rename = "nodeID")]
    pub node_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionManifest {
    pub name: String,
    pub mode: String,
    #[serde(default, deserialize_with = "nullable")]
    pub destinations: Vec<String>,
}

/// Server reply to a bucket-metadata restore: how backed-up shard IDs map onto new ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredBucketMappings {
    pub id: String,
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub shard_mappings: Vec<BucketShardMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketShardMapping {
    pub old_id: i64,
    pub new_id: i64,
}
