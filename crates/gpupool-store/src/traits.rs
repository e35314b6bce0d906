//! Store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpupool_core::{
    Cluster, ClusterId, Device, DeviceId, Node, NodeId, RecordQuery, RelationQuery, UsageRecord,
    UsageRelation,
};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// An entity together with the version used for compare-and-set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Compare-and-set write of one entity
#[derive(Debug, Clone)]
pub enum EntityWrite<K, T> {
    /// Requires the entity to be absent
    Insert(T),
    /// Requires the stored version to equal `expected`
    Update { expected: u64, value: T },
    /// Requires the stored version to equal `expected`
    Delete { id: K, expected: u64 },
}

/// Usage relation change
#[derive(Debug, Clone)]
pub enum RelationWrite {
    /// Open a relation; the device must have none open
    Open(UsageRelation),
    /// Mark the open relation of a device as committed
    Commit { device_id: DeviceId, at: DateTime<Utc> },
    /// Close the open relation of a device
    Close { device_id: DeviceId, at: DateTime<Utc> },
}

/// A set of writes applied atomically by [`Store::commit`]
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub clusters: Vec<EntityWrite<ClusterId, Cluster>>,
    pub nodes: Vec<EntityWrite<NodeId, Node>>,
    pub devices: Vec<EntityWrite<DeviceId, Device>>,
    pub records: Vec<UsageRecord>,
    pub relations: Vec<RelationWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
            && self.nodes.is_empty()
            && self.devices.is_empty()
            && self.records.is_empty()
            && self.relations.is_empty()
    }

    pub fn insert_cluster(&mut self, cluster: Cluster) -> &mut Self {
        self.clusters.push(EntityWrite::Insert(cluster));
        self
    }

    pub fn update_cluster(&mut self, expected: u64, cluster: Cluster) -> &mut Self {
        self.clusters.push(EntityWrite::Update {
            expected,
            value: cluster,
        });
        self
    }

    pub fn delete_cluster(&mut self, id: ClusterId, expected: u64) -> &mut Self {
        self.clusters.push(EntityWrite::Delete { id, expected });
        self
    }

    pub fn insert_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(EntityWrite::Insert(node));
        self
    }

    pub fn update_node(&mut self, expected: u64, node: Node) -> &mut Self {
        self.nodes.push(EntityWrite::Update {
            expected,
            value: node,
        });
        self
    }

    pub fn delete_node(&mut self, id: NodeId, expected: u64) -> &mut Self {
        self.nodes.push(EntityWrite::Delete { id, expected });
        self
    }

    pub fn insert_device(&mut self, device: Device) -> &mut Self {
        self.devices.push(EntityWrite::Insert(device));
        self
    }

    pub fn update_device(&mut self, expected: u64, device: Device) -> &mut Self {
        self.devices.push(EntityWrite::Update {
            expected,
            value: device,
        });
        self
    }

    pub fn append_record(&mut self, record: UsageRecord) -> &mut Self {
        self.records.push(record);
        self
    }

    pub fn open_relation(&mut self, relation: UsageRelation) -> &mut Self {
        self.relations.push(RelationWrite::Open(relation));
        self
    }

    pub fn commit_relation(&mut self, device_id: DeviceId, at: DateTime<Utc>) -> &mut Self {
        self.relations.push(RelationWrite::Commit { device_id, at });
        self
    }

    pub fn close_relation(&mut self, device_id: DeviceId, at: DateTime<Utc>) -> &mut Self {
        self.relations.push(RelationWrite::Close { device_id, at });
        self
    }

    /// Merge another batch into this one, preserving order
    pub fn extend(&mut self, other: WriteBatch) {
        self.clusters.extend(other.clusters);
        self.nodes.extend(other.nodes);
        self.devices.extend(other.devices);
        self.records.extend(other.records);
        self.relations.extend(other.relations);
    }
}

/// Transactional entity store
///
/// Reads return snapshots that may trail concurrent commits. Every entity
/// write in a batch is a compare-and-set against the stored version, or
/// against the version left by an earlier write to the same entity in that
/// batch. A batch applies completely or not at all.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_cluster(&self, id: &ClusterId) -> StoreResult<Option<Versioned<Cluster>>>;

    /// All clusters ordered by id
    async fn list_clusters(&self) -> StoreResult<Vec<Versioned<Cluster>>>;

    async fn get_node(&self, id: &NodeId) -> StoreResult<Option<Versioned<Node>>>;

    /// All nodes ordered by id
    async fn list_nodes(&self) -> StoreResult<Vec<Versioned<Node>>>;

    async fn get_device(&self, id: &DeviceId) -> StoreResult<Option<Versioned<Device>>>;

    /// All devices ordered by id
    async fn list_devices(&self) -> StoreResult<Vec<Versioned<Device>>>;

    /// The open relation of a device, if any
    async fn open_relation(&self, device_id: &DeviceId) -> StoreResult<Option<UsageRelation>>;

    /// All open relations
    async fn list_open_relations(&self) -> StoreResult<Vec<UsageRelation>>;

    /// Up to `limit` matching relations ordered by start time, then id
    async fn list_relations(
        &self,
        query: &RelationQuery,
        limit: usize,
    ) -> StoreResult<Vec<UsageRelation>>;

    /// Up to `limit` matching records in append order
    async fn list_records(&self, query: &RecordQuery, limit: usize)
        -> StoreResult<Vec<UsageRecord>>;

    /// Atomically apply a batch
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;
}
