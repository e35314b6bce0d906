//! Inventory service: clusters, nodes and device membership

use gpupool_core::{
    Clock, Cluster, ClusterId, Device, DeviceId, DeviceStatus, EntityKind, HardwareDescriptor,
    InventorySummary, Node, NodeCapacity, NodeId, Outcome, PoolError, PoolResult, Transition,
    TransitionKind, UsageRecord,
};
use gpupool_store::{Store, Versioned, WriteBatch};
use std::sync::Arc;
use tracing::{info, warn};

use crate::ledger::UsageLedger;
use crate::locks::DeviceLocks;

/// Administrative operations on the inventory
///
/// Device membership changes happen under the device lock shared with the
/// allocation engine, so they serialize with allocations of the same device.
#[derive(Clone)]
pub struct Inventory {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    locks: Arc<DeviceLocks>,
    ledger: UsageLedger,
}

impl Inventory {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        locks: Arc<DeviceLocks>,
        ledger: UsageLedger,
    ) -> Self {
        Self {
            store,
            clock,
            locks,
            ledger,
        }
    }

    async fn load_cluster(&self, id: &ClusterId) -> PoolResult<Versioned<Cluster>> {
        self.store
            .get_cluster(id)
            .await?
            .ok_or_else(|| PoolError::not_found(EntityKind::Cluster, id))
    }

    async fn load_node(&self, id: &NodeId) -> PoolResult<Versioned<Node>> {
        self.store
            .get_node(id)
            .await?
            .ok_or_else(|| PoolError::not_found(EntityKind::Node, id))
    }

    async fn load_device(&self, id: &DeviceId) -> PoolResult<Versioned<Device>> {
        self.store
            .get_device(id)
            .await?
            .ok_or_else(|| PoolError::not_found(EntityKind::Device, id))
    }

    /// Create an empty cluster
    pub async fn create_cluster(
        &self,
        id: ClusterId,
        display_name: impl Into<String>,
    ) -> PoolResult<Cluster> {
        if self.store.get_cluster(&id).await?.is_some() {
            return Err(PoolError::conflict(
                format!("cluster {}", id),
                "exists",
                "cluster already exists",
            ));
        }

        let cluster = Cluster::new(id, display_name.into(), self.clock.now());
        let mut batch = WriteBatch::new();
        batch.insert_cluster(cluster.clone());
        self.store.commit(batch).await?;

        info!(cluster_id = %cluster.id, "Created cluster");
        Ok(cluster)
    }

    /// Delete a cluster that owns no nodes
    pub async fn delete_cluster(&self, id: &ClusterId) -> PoolResult<()> {
        let cluster = self.load_cluster(id).await?;
        if !cluster.value.node_ids.is_empty() {
            return Err(PoolError::conflict(
                format!("cluster {}", id),
                format!("{} node(s)", cluster.value.node_ids.len()),
                "cluster still owns nodes",
            ));
        }

        let mut batch = WriteBatch::new();
        batch.delete_cluster(id.clone(), cluster.version);
        self.store.commit(batch).await?;

        info!(cluster_id = %id, "Deleted cluster");
        Ok(())
    }

    pub async fn get_cluster(&self, id: &ClusterId) -> PoolResult<Cluster> {
        Ok(self.load_cluster(id).await?.value)
    }

    pub async fn list_clusters(&self) -> PoolResult<Vec<Cluster>> {
        Ok(self
            .store
            .list_clusters()
            .await?
            .into_iter()
            .map(|c| c.value)
            .collect())
    }

    /// Create an empty node inside a cluster
    pub async fn create_node(
        &self,
        cluster_id: &ClusterId,
        id: NodeId,
        name: impl Into<String>,
        capacity: NodeCapacity,
    ) -> PoolResult<Node> {
        let mut cluster = self.load_cluster(cluster_id).await?;
        if let Some(existing) = self.store.get_node(&id).await? {
            return Err(PoolError::conflict(
                format!("node {}", id),
                format!("in cluster {}", existing.value.cluster_id),
                "node already exists",
            ));
        }

        let node = Node::new(
            id,
            cluster_id.clone(),
            name.into(),
            capacity,
            self.clock.now(),
        );
        cluster.value.node_ids.insert(node.id.clone());

        let mut batch = WriteBatch::new();
        batch
            .insert_node(node.clone())
            .update_cluster(cluster.version, cluster.value);
        self.store.commit(batch).await?;

        info!(
            cluster_id = %cluster_id,
            node_id = %node.id,
            device_slots = node.capacity.device_slots,
            "Created node"
        );
        Ok(node)
    }

    /// Delete a node that has no member devices
    pub async fn delete_node(&self, id: &NodeId) -> PoolResult<()> {
        let node = self.load_node(id).await?;
        if !node.value.device_ids.is_empty() {
            return Err(PoolError::conflict(
                format!("node {}", id),
                format!("{} device(s)", node.value.device_ids.len()),
                "node still has member devices",
            ));
        }

        let mut batch = WriteBatch::new();
        batch.delete_node(id.clone(), node.version);
        if let Some(mut cluster) = self.store.get_cluster(&node.value.cluster_id).await? {
            cluster.value.node_ids.remove(id);
            batch.update_cluster(cluster.version, cluster.value);
        }
        self.store.commit(batch).await?;

        info!(node_id = %id, cluster_id = %node.value.cluster_id, "Deleted node");
        Ok(())
    }

    pub async fn get_node(&self, id: &NodeId) -> PoolResult<Node> {
        Ok(self.load_node(id).await?.value)
    }

    pub async fn list_nodes_by_cluster(&self, cluster_id: &ClusterId) -> PoolResult<Vec<Node>> {
        let cluster = self.load_cluster(cluster_id).await?;
        let mut nodes = Vec::with_capacity(cluster.value.node_ids.len());
        for node_id in &cluster.value.node_ids {
            if let Some(node) = self.store.get_node(node_id).await? {
                nodes.push(node.value);
            }
        }
        Ok(nodes)
    }

    pub async fn get_device(&self, id: &DeviceId) -> PoolResult<Device> {
        Ok(self.load_device(id).await?.value)
    }

    /// Devices of a node ordered by index. May trail concurrent writes.
    pub async fn list_devices_by_node(&self, node_id: &NodeId) -> PoolResult<Vec<Device>> {
        self.load_node(node_id).await?;

        let mut devices: Vec<Device> = self
            .store
            .list_devices()
            .await?
            .into_iter()
            .map(|d| d.value)
            .filter(|d| d.node_id.as_ref() == Some(node_id))
            .collect();
        devices.sort_by(|a, b| (a.hardware.index, &a.id).cmp(&(b.hardware.index, &b.id)));
        Ok(devices)
    }

    /// Devices of a cluster ordered by node, then index
    pub async fn list_devices_by_cluster(&self, cluster_id: &ClusterId) -> PoolResult<Vec<Device>> {
        let cluster = self.load_cluster(cluster_id).await?.value;

        let mut devices: Vec<Device> = self
            .store
            .list_devices()
            .await?
            .into_iter()
            .map(|d| d.value)
            .filter(|d| {
                d.node_id
                    .as_ref()
                    .is_some_and(|n| cluster.node_ids.contains(n))
            })
            .collect();
        devices.sort_by(|a, b| {
            (&a.node_id, a.hardware.index, &a.id).cmp(&(&b.node_id, b.hardware.index, &b.id))
        });
        Ok(devices)
    }

    /// Add a new or detached device to a node. The device becomes Free.
    pub async fn add_device_to_node(
        &self,
        node_id: &NodeId,
        device_id: DeviceId,
        hardware: HardwareDescriptor,
    ) -> PoolResult<Device> {
        let _guard = self.locks.lock(&device_id).await;
        let mut node = self.load_node(node_id).await?;
        let now = self.clock.now();

        let (mut device, version) = match self.store.get_device(&device_id).await? {
            Some(Versioned { value, .. }) if value.node_id.is_some() => {
                let owner = value.node_id.as_ref().map(NodeId::to_string).unwrap_or_default();
                return Err(PoolError::conflict(
                    format!("device {}", device_id),
                    value.status(),
                    format!("device already belongs to node {}", owner),
                ));
            }
            Some(Versioned { version, mut value }) => {
                value.hardware = hardware;
                (value, Some(version))
            }
            None => (Device::new(device_id.clone(), hardware, now), None),
        };

        if !node.value.has_free_slot() {
            return Err(PoolError::conflict(
                format!("node {}", node_id),
                format!("{}/{} slots used", node.value.device_ids.len(), node.value.capacity.device_slots),
                "node is at capacity",
            ));
        }
        for member in &node.value.device_ids {
            if let Some(other) = self.store.get_device(member).await? {
                if other.value.hardware.index == device.hardware.index {
                    return Err(PoolError::conflict(
                        format!("node {}", node_id),
                        format!("index {} used by {}", device.hardware.index, member),
                        "duplicate device index",
                    ));
                }
            }
        }

        device.apply(&Transition::Attach, now)?;
        device.node_id = Some(node_id.clone());
        node.value.device_ids.insert(device_id.clone());

        let mut batch = WriteBatch::new();
        match version {
            Some(v) => batch.update_device(v, device.clone()),
            None => batch.insert_device(device.clone()),
        };
        batch.update_node(node.version, node.value);
        self.ledger.record_event(
            &mut batch,
            &device_id,
            None,
            TransitionKind::Attach,
            Outcome::Success,
            now,
        );
        self.store.commit(batch).await?;

        info!(
            node_id = %node_id,
            device_id = %device_id,
            index = device.hardware.index,
            model = %device.hardware.model,
            "Added device to node"
        );
        Ok(device)
    }

    /// Detach a device from its node. Fails while the device is held.
    pub async fn remove_device_from_node(
        &self,
        node_id: &NodeId,
        device_id: &DeviceId,
    ) -> PoolResult<Device> {
        let _guard = self.locks.lock(device_id).await;
        let mut node = self.load_node(node_id).await?;
        let Versioned { version, value: mut device } = self.load_device(device_id).await?;

        if device.node_id.as_ref() != Some(node_id) {
            let owner = match &device.node_id {
                Some(n) => format!("device belongs to node {}", n),
                None => "device is detached".to_string(),
            };
            return Err(PoolError::conflict(
                format!("device {}", device_id),
                device.status(),
                owner,
            ));
        }
        if matches!(device.status(), DeviceStatus::Reserved | DeviceStatus::Allocated) {
            return Err(PoolError::conflict(
                format!("device {}", device_id),
                device.status(),
                "device must be released before removal",
            ));
        }

        let now = self.clock.now();
        let mut batch = WriteBatch::new();
        if device.status() == DeviceStatus::Free {
            device.apply(&Transition::Detach, now)?;
            self.ledger.record_event(
                &mut batch,
                device_id,
                None,
                TransitionKind::Detach,
                Outcome::Success,
                now,
            );
        } else {
            device.updated_at = now;
        }
        device.node_id = None;
        node.value.device_ids.remove(device_id);

        batch
            .update_device(version, device.clone())
            .update_node(node.version, node.value);
        self.store.commit(batch).await?;

        info!(node_id = %node_id, device_id = %device_id, "Removed device from node");
        Ok(device)
    }

    /// Take an attached device out of service without removing it.
    ///
    /// An allocated device is drained forcibly: the holder loses it and its
    /// relation is closed. Reserved devices are refused while their request
    /// is in flight.
    pub async fn set_device_offline(&self, device_id: &DeviceId) -> PoolResult<Device> {
        let _guard = self.locks.lock(device_id).await;
        let Versioned { version, value: mut device } = self.load_device(device_id).await?;

        if device.node_id.is_none() {
            return Err(PoolError::conflict(
                format!("device {}", device_id),
                device.status(),
                "device is detached",
            ));
        }
        match device.status() {
            DeviceStatus::Offline => return Ok(device),
            DeviceStatus::Reserved => {
                return Err(PoolError::conflict(
                    format!("device {}", device_id),
                    device.status(),
                    "reservation in progress",
                ));
            }
            DeviceStatus::Free | DeviceStatus::Allocated => {}
        }

        let now = self.clock.now();
        let previous = device.apply(&Transition::Drain, now)?;
        let mut record = UsageRecord::new(
            TransitionKind::Drain,
            device_id.clone(),
            None,
            Outcome::Success,
            now,
        );

        let mut batch = WriteBatch::new();
        if let Some(holder) = previous.holder() {
            warn!(device_id = %device_id, holder = %holder, "Draining allocated device");
            record = record.with_previous(holder.clone());
            self.ledger.close_relation(&mut batch, device_id, now);
        }
        batch
            .update_device(version, device.clone())
            .append_record(record);
        self.store.commit(batch).await?;

        info!(device_id = %device_id, "Device set offline");
        Ok(device)
    }

    /// Return a drained device to service
    pub async fn set_device_online(&self, device_id: &DeviceId) -> PoolResult<Device> {
        let _guard = self.locks.lock(device_id).await;
        let Versioned { version, value: mut device } = self.load_device(device_id).await?;

        if device.node_id.is_none() {
            return Err(PoolError::conflict(
                format!("device {}", device_id),
                device.status(),
                "device is detached; add it to a node instead",
            ));
        }
        if device.status() == DeviceStatus::Free {
            return Ok(device);
        }

        let now = self.clock.now();
        device.apply(&Transition::Restore, now)?;

        let mut batch = WriteBatch::new();
        batch.update_device(version, device.clone());
        self.ledger.record_event(
            &mut batch,
            device_id,
            None,
            TransitionKind::Restore,
            Outcome::Success,
            now,
        );
        self.store.commit(batch).await?;

        info!(device_id = %device_id, "Device set online");
        Ok(device)
    }

    /// Device counts by status for a node
    pub async fn node_summary(&self, node_id: &NodeId) -> PoolResult<InventorySummary> {
        let mut summary = InventorySummary::default();
        for device in self.list_devices_by_node(node_id).await? {
            summary.count(device.status());
        }
        Ok(summary)
    }

    /// Device counts by status for a cluster
    pub async fn cluster_summary(&self, cluster_id: &ClusterId) -> PoolResult<InventorySummary> {
        let mut summary = InventorySummary::default();
        for device in self.list_devices_by_cluster(cluster_id).await? {
            summary.count(device.status());
        }
        Ok(summary)
    }
}
