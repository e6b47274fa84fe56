//! Bucket metadata extraction from 2.0.x KV snapshots.
//!
//! Servers before 2.1 have no metadata snapshot endpoint, so bucket metadata
//! is read directly out of the BoltDB file they hand out instead.

pub mod bolt;
pub mod meta;

use crate::api::model::{
    BucketMetadataManifest, RetentionPolicyManifest, ShardGroupManifest, ShardManifest,
    ShardOwner, SubscriptionManifest,
};
use crate::utils::{BackupError, Result};
use bolt::BoltDb;
use chrono::{DateTime, Utc};
use prost::Message;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const BUCKETS_BUCKET: &[u8] = b"bucketsv1";
const ORGANIZATIONS_BUCKET: &[u8] = b"organizationsv1";
const V1_METADATA_BUCKET: &[u8] = b"v1_tsm1_metadata";
const V1_METADATA_KEY: &[u8] = b"meta.db";

const SYSTEM_BUCKET_TYPE: i64 = 1;

#[derive(Debug, Deserialize)]
struct StoredBucket {
    id: String,
    #[serde(rename = "orgID")]
    org_id: String,
    #[serde(default, rename = "type")]
    kind: i64,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoredOrganization {
    id: String,
    name: String,
}

/// Read bucket metadata out of the BoltDB file at `path`.
///
/// Blocking: async callers should run this on the blocking pool.
pub fn extract_bucket_metadata(path: &Path) -> Result<Vec<BucketMetadataManifest>> {
    let db = BoltDb::open(path)?;

    let mut buckets = Vec::new();
    let buckets_db = db
        .bucket(BUCKETS_BUCKET)?
        .ok_or_else(|| BackupError::KvStore("bucket metadata not found in local KV store".to_string()))?;
    buckets_db
        .for_each(|_, v| {
            let bucket: StoredBucket = serde_json::from_slice(v)?;
            if bucket.kind != SYSTEM_BUCKET_TYPE {
                buckets.push(bucket);
            }
            Ok(())
        })
        .map_err(|e| e.context("failed to read bucket metadata from local KV store"))?;

    let mut org_names = HashMap::new();
    let orgs_db = db.bucket(ORGANIZATIONS_BUCKET)?.ok_or_else(|| {
        BackupError::KvStore("organization metadata not found in local KV store".to_string())
    })?;
    orgs_db
        .for_each(|_, v| {
            let org: StoredOrganization = serde_json::from_slice(v)?;
            org_names.insert(org.id, org.name);
            Ok(())
        })
        .map_err(|e| e.context("failed to read organization metadata from local KV store"))?;

    let raw_meta = db
        .bucket(V1_METADATA_BUCKET)?
        .map(|b| b.get(V1_METADATA_KEY))
        .transpose()?
        .flatten()
        .ok_or_else(|| BackupError::KvStore("v1 database info not found in local KV store".to_string()))?;
    let data = meta::Data::decode(raw_meta)?;
    let mut db_infos: HashMap<String, meta::DatabaseInfo> = data
        .databases
        .into_iter()
        .filter_map(|dbi| dbi.name.clone().map(|name| (name, dbi)))
        .collect();

    debug!(
        "Read {} buckets, {} organizations and {} database infos from {:?}",
        buckets.len(),
        org_names.len(),
        db_infos.len(),
        path
    );

    buckets
        .into_iter()
        .map(|bucket| {
            let org_name = org_names.get(&bucket.org_id).ok_or_else(|| {
                BackupError::Inconsistent(format!(
                    "no organization found with ID {:?}",
                    bucket.org_id
                ))
            })?;
            let dbi = db_infos.remove(&bucket.id).ok_or_else(|| {
                BackupError::Inconsistent(format!(
                    "no V1 database info found for bucket {:?}",
                    bucket.name
                ))
            })?;
            Ok(combine(bucket, org_name.clone(), dbi))
        })
        .collect()
}

fn combine(bucket: StoredBucket, org_name: String, dbi: meta::DatabaseInfo) -> BucketMetadataManifest {
    BucketMetadataManifest {
        organization_id: bucket.org_id,
        organization_name: org_name,
        bucket_id: bucket.id,
        bucket_name: bucket.name,
        description: bucket.description.filter(|d| !d.is_empty()),
        default_retention_policy: dbi.default_retention_policy.unwrap_or_default(),
        retention_policies: dbi.retention_policies.into_iter().map(convert_rp).collect(),
    }
}

fn convert_rp(rp: meta::RetentionPolicyInfo) -> RetentionPolicyManifest {
    RetentionPolicyManifest {
        name: rp.name.unwrap_or_default(),
        replica_n: rp.replica_n.unwrap_or_default() as i32,
        duration: rp.duration.unwrap_or_default(),
        shard_group_duration: rp.shard_group_duration.unwrap_or_default(),
        shard_groups: rp.shard_groups.into_iter().map(convert_shard_group).collect(),
        subscriptions: rp
            .subscriptions
            .into_iter()
            .map(|s| SubscriptionManifest {
                name: s.name.unwrap_or_default(),
                mode: s.mode.unwrap_or_default(),
                destinations: s.destinations,
            })
            .collect(),
    }
}

/// Zero means "never" in the meta store.
fn nonzero_time(nanos: Option<i64>) -> Option<DateTime<Utc>> {
    nanos
        .filter(|n| *n != 0)
        .map(DateTime::<Utc>::from_timestamp_nanos)
}

fn convert_shard_group(sg: meta::ShardGroupInfo) -> ShardGroupManifest {
    ShardGroupManifest {
        id: sg.id.unwrap_or_default() as i64,
        start_time: DateTime::<Utc>::from_timestamp_nanos(sg.start_time.unwrap_or_default()),
        end_time: DateTime::<Utc>::from_timestamp_nanos(sg.end_time.unwrap_or_default()),
        deleted_at: nonzero_time(sg.deleted_at),
        truncated_at: nonzero_time(sg.truncated_at),
        shards: sg.shards.into_iter().map(convert_shard).collect(),
    }
}

fn convert_shard(shard: meta::ShardInfo) -> ShardManifest {
    let shard_owners = if shard.owners.is_empty() {
        // Stores written before structured owners only carry the flat ID list.
        shard
            .owner_ids
            .iter()
            .map(|id| ShardOwner { node_id: *id as i64 })
            .collect()
    } else {
        shard
            .owners
            .iter()
            .map(|o| ShardOwner {
                node_id: o.node_id.unwrap_or_default() as i64,
            })
            .collect()
    };

    ShardManifest {
        id: shard.id.unwrap_or_default() as i64,
        shard_owners,
    }
}

/// Encode bucket metadata as the v1 database info a 2.0.x server restores a bucket from.
///
/// The database is named after the backed-up bucket ID; the server matches
/// shards by that name and answers with their new IDs.
pub fn database_info(bucket: &BucketMetadataManifest) -> meta::DatabaseInfo {
    meta::DatabaseInfo {
        name: Some(bucket.bucket_id.clone()),
        default_retention_policy: Some(bucket.default_retention_policy.clone()),
        retention_policies: bucket
            .retention_policies
            .iter()
            .map(|rp| meta::RetentionPolicyInfo {
                name: Some(rp.name.clone()),
                duration: Some(rp.duration),
                shard_group_duration: Some(rp.shard_group_duration),
                replica_n: Some(rp.replica_n as u32),
                shard_groups: rp.shard_groups.iter().map(shard_group_info).collect(),
                subscriptions: rp
                    .subscriptions
                    .iter()
                    .map(|sub| meta::SubscriptionInfo {
                        name: Some(sub.name.clone()),
                        mode: Some(sub.mode.clone()),
                        destinations: sub.destinations.clone(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn shard_group_info(sg: &ShardGroupManifest) -> meta::ShardGroupInfo {
    let nanos = |t: &DateTime<Utc>| t.timestamp_nanos_opt().unwrap_or_default();
    meta::ShardGroupInfo {
        id: Some(sg.id as u64),
        start_time: Some(nanos(&sg.start_time)),
        end_time: Some(nanos(&sg.end_time)),
        deleted_at: Some(sg.deleted_at.as_ref().map(nanos).unwrap_or_default()),
        shards: sg
            .shards
            .iter()
            .map(|shard| meta::ShardInfo {
                id: Some(shard.id as u64),
                owner_ids: Vec::new(),
                owners: shard
                    .shard_owners
                    .iter()
                    .map(|o| meta::ShardOwner {
                        node_id: Some(o.node_id as u64),
                    })
                    .collect(),
            })
            .collect(),
        truncated_at: Some(sg.truncated_at.as_ref().map(nanos).unwrap_or_default()),
    }
}
