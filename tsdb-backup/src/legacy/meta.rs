//! Protobuf messages of the 1.x-style meta store kept inside 2.0.x KV snapshots.
//!
//! Only the fields needed to rebuild bucket metadata are declared; prost skips
//! the rest while decoding.

#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(message, repeated, tag = "5")]
    pub databases: Vec<DatabaseInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DatabaseInfo {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub default_retention_policy: Option<String>,
    #[prost(message, repeated, tag = "3")]
    pub retention_policies: Vec<RetentionPolicyInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RetentionPolicyInfo {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub duration: Option<i64>,
    #[prost(int64, optional, tag = "3")]
    pub shard_group_duration: Option<i64>,
    #[prost(uint32, optional, tag = "4")]
    pub replica_n: Option<u32>,
    #[prost(message, repeated, tag = "5")]
    pub shard_groups: Vec<ShardGroupInfo>,
    #[prost(message, repeated, tag = "6")]
    pub subscriptions: Vec<SubscriptionInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ShardGroupInfo {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    /// Nanoseconds since the Unix epoch.
    #[prost(int64, optional, tag = "2")]
    pub start_time: Option<i64>,
    #[prost(int64, optional, tag = "3")]
    pub end_time: Option<i64>,
    #[prost(int64, optional, tag = "4")]
    pub deleted_at: Option<i64>,
    #[prost(message, repeated, tag = "5")]
    pub shards: Vec<ShardInfo>,
    #[prost(int64, optional, tag = "6")]
    pub truncated_at: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ShardInfo {
    #[prost(uint64, optional, tag = "1")]
    pub id: Option<u64>,
    /// Deprecated owner list, still populated by old writers.
    #[prost(uint64, repeated, packed = "false", tag = "2")]
    pub owner_ids: Vec<u64>,
    #[prost(message, repeated, tag = "3")]
    pub owners: Vec<ShardOwner>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscriptionInfo {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub mode: Option<String>,
    #[prost(string, repeated, tag = "3")]
    pub destinations: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ShardOwner {
    #[prost(uint64, optional, tag = "1")]
    pub node_id: Option<u64>,
}
