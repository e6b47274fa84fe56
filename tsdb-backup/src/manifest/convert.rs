//! Conversion between server bucket metadata and manifest bucket entries.

use super::{
    BucketEntry, FileEntry, RetentionPolicyEntry, ShardEntry, ShardGroupEntry, ShardOwnerEntry,
    SubscriptionEntry,
};
use crate::api::model::{
    BucketMetadataManifest, RetentionPolicyManifest, ShardGroupManifest, ShardManifest,
    ShardOwner, SubscriptionManifest,
};
use crate::utils::{BackupError, Result};
use async_trait::async_trait;

/// Outcome of capturing one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardFetch {
    Found(FileEntry),
    /// The shard vanished (e.g. dropped by retention). It is left out of the manifest.
    NotFound,
}

/// Produces the archive file for a shard.
#[async_trait]
pub trait ShardFetcher: Send + Sync {
    async fn fetch_shard(&self, shard_id: i64) -> Result<ShardFetch>;
}

/// Build a manifest bucket entry, fetching every shard through `fetcher`.
///
/// Shards reported as [`ShardFetch::NotFound`] are dropped, and a shard group
/// whose shards were all dropped is kept with an empty shard list.
pub async fn convert_bucket_manifest<F>(
    manifest: BucketMetadataManifest,
    fetcher: &F,
) -> Result<BucketEntry>
where
    F: ShardFetcher + ?Sized,
{
    let bucket_id = manifest.bucket_id;
    let mut retention_policies = Vec::with_capacity(manifest.retention_policies.len());

    for rp in manifest.retention_policies {
        let mut shard_groups = Vec::with_capacity(rp.shard_groups.len());

        for sg in rp.shard_groups {
            let mut shards = Vec::with_capacity(sg.shards.len());

            for shard in sg.shards {
                let fetched = fetcher
                    .fetch_shard(shard.id)
                    .await
                    .map_err(|e| BackupError::Shard {
                        shard_id: shard.id,
                        bucket_id: bucket_id.clone(),
                        source: Box::new(e),
                    })?;

                if let ShardFetch::Found(file) = fetched {
                    shards.push(ShardEntry {
                        id: shard.id,
                        shard_owners: shard
                            .shard_owners
                            .iter()
                            .map(|o| ShardOwnerEntry { node_id: o.node_id })
                            .collect(),
                        file,
                    });
                }
            }

            shard_groups.push(ShardGroupEntry {
                id: sg.id,
                start_time: sg.start_time,
                end_time: sg.end_time,
                deleted_at: sg.deleted_at,
                truncated_at: sg.truncated_at,
                shards,
            });
        }

        retention_policies.push(RetentionPolicyEntry {
            name: rp.name,
            replica_n: rp.replica_n,
            duration: rp.duration,
            shard_group_duration: rp.shard_group_duration,
            shard_groups,
            subscriptions: rp
                .subscriptions
                .into_iter()
                .map(|s| SubscriptionEntry {
                    name: s.name,
                    mode: s.mode,
                    destinations: s.destinations,
                })
                .collect(),
        });
    }

    Ok(BucketEntry {
        organization_id: manifest.organization_id,
        organization_name: manifest.organization_name,
        bucket_id,
        bucket_name: manifest.bucket_name,
        description: manifest.description,
        default_retention_policy: manifest.default_retention_policy,
        retention_policies,
    })
}

impl From<&BucketEntry> for BucketMetadataManifest {
    fn from(entry: &BucketEntry) -> Self {
        BucketMetadataManifest {
            organization_id: entry.organization_id.clone(),
            organization_name: entry.organization_name.clone(),
            bucket_id: entry.bucket_id.clone(),
            bucket_name: entry.bucket_name.clone(),
            description: entry.description.clone(),
            default_retention_policy: entry.default_retention_policy.clone(),
            retention_policies: entry
                .retention_policies
                .iter()
                .map(RetentionPolicyManifest::from)
                .collect(),
        }
    }
}

impl From<&RetentionPolicyEntry> for RetentionPolicyManifest {
    fn from(rp: &RetentionPolicyEntry) -> Self {
        RetentionPolicyManifest {
            name: rp.name.clone(),
            replica_n: rp.replica_n,
            duration: rp.duration,
            shard_group_duration: rp.shard_group_duration,
            shard_groups: rp.shard_groups.iter().map(ShardGroupManifest::from).collect(),
            subscriptions: rp
                .subscriptions
                .iter()
                .map(|s| SubscriptionManifest {
                    name: s.name.clone(),
                    mode: s.mode.clone(),
                    destinations: s.destinations.clone(),
                })
                .collect(),
        }
    }
}

impl From<&ShardGroupEntry> for ShardGroupManifest {
    fn from(sg: &ShardGroupEntry) -> Self {
        ShardGroupManifest {
            id: sg.id,
            start_time: sg.start_time,
            end_time: sg.end_time,
            deleted_at: sg.deleted_at,
            truncated_at: sg.truncated_at,
            shards: sg
                .shards
                .iter()
                .map(|s| ShardManifest {
                    id: s.id,
                    shard_owners: s
                        .shard_owners
                        .iter()
                        .map(|o| ShardOwner { node_id: o.node_id })
                        .collect(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::manifest::FileCompression;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fetcher backed by a fixed table; IDs absent from the table are not found.
    pub(crate) struct TableFetcher {
        pub files: HashMap<i64, FileEntry>,
        pub failing: Option<i64>,
        pub calls: Mutex<Vec<i64>>,
    }

    impl TableFetcher {
        pub fn new(ids: &[i64]) -> Self {
            let files = ids
                .iter()
                .map(|id| {
                    (
                        *id,
                        FileEntry {
                            file_name: format!("snap.{}.tar.gz", id),
                            size: 100 + *id,
                            compression: FileCompression::Gzip,
                        },
                    )
                })
                .collect();
            Self {
                files,
                failing: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ShardFetcher for TableFetcher {
        async fn fetch_shard(&self, shard_id: i64) -> Result<ShardFetch> {
            self.calls.lock().unwrap().push(shard_id);
            if self.failing == Some(shard_id) {
                return Err(BackupError::Protocol("connection reset".to_string()));
            }
            Ok(self
                .files
                .get(&shard_id)
                .cloned()
                .map(ShardFetch::Found)
                .unwrap_or(ShardFetch::NotFound))
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    pub(crate) fn sample_bucket(bucket_id: &str, shard_ids: &[i64]) -> BucketMetadataManifest {
        BucketMetadataManifest {
            organization_id: "123".to_string(),
            organization_name: "org".to_string(),
            bucket_id: bucket_id.to_string(),
            bucket_name: format!("bucket-{}", bucket_id),
            description: Some("A description".to_string()),
            default_retention_policy: "foo".to_string(),
            retention_policies: vec![RetentionPolicyManifest {
                name: "foo".to_string(),
                replica_n: 1,
                duration: 100,
                shard_group_duration: 10,
                shard_groups: vec![ShardGroupManifest {
                    id: 1,
                    start_time: ts(1_600_000_000),
                    end_time: ts(1_600_000_010),
                    deleted_at: None,
                    truncated_at: Some(ts(1_600_000_005)),
                    shards: shard_ids
                        .iter()
                        .map(|id| ShardManifest {
                            id: *id,
                            shard_owners: vec![ShardOwner { node_id: 1 }],
                        })
                        .collect(),
                }],
                subscriptions: vec![SubscriptionManifest {
                    name: "sub".to_string(),
                    mode: "ALL".to_string(),
                    destinations: vec!["udp://localhost:9000".to_string()],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_round_trip_with_all_shards_found() {
        let original = sample_bucket("456", &[10, 20]);
        let fetcher = TableFetcher::new(&[10, 20]);

        let entry = convert_bucket_manifest(original.clone(), &fetcher)
            .await
            .unwrap();

        assert_eq!(entry.shards().count(), 2);
        assert_eq!(entry.shards().next().unwrap().file.file_name, "snap.10.tar.gz");
        assert_eq!(BucketMetadataManifest::from(&entry), original);
    }

    #[tokio::test]
    async fn test_not_found_shards_are_dropped() {
        let original = sample_bucket("456", &[10, 20, 30]);
        let fetcher = TableFetcher::new(&[10, 30]);

        let entry = convert_bucket_manifest(original, &fetcher).await.unwrap();

        let ids: Vec<i64> = entry.shards().map(|s| s.id).collect();
        assert_eq!(ids, vec![10, 30]);
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_empty_group_survives_when_all_shards_missing() {
        let original = sample_bucket("456", &[10]);
        let fetcher = TableFetcher::new(&[]);

        let entry = convert_bucket_manifest(original, &fetcher).await.unwrap();

        assert_eq!(entry.retention_policies[0].shard_groups.len(), 1);
        assert!(entry.retention_policies[0].shard_groups[0].shards.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_error_names_shard_and_bucket() {
        let original = sample_bucket("456", &[10, 20, 30]);
        let mut fetcher = TableFetcher::new(&[10, 20, 30]);
        fetcher.failing = Some(20);

        let err = convert_bucket_manifest(original, &fetcher)
            .await
            .unwrap_err();

        match &err {
            BackupError::Shard {
                shard_id, bucket_id, ..
            } => {
                assert_eq!(*shard_id, 20);
                assert_eq!(bucket_id, "456");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.to_string().contains("connection reset"));
        // Conversion stops at the first failure.
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![10, 20]);
    }
}
