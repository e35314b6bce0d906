//! Cluster, Node and Device inventory types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::allocation::{Allocation, DeviceStatus};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Cluster identity
    ClusterId
);
string_id!(
    /// Node identity
    NodeId
);
string_id!(
    /// Device identity
    DeviceId
);
string_id!(
    /// Opaque identity of a job or queue holding devices. Only compared, never parsed.
    ConsumerId
);

/// Top-level grouping of nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    /// Human-readable name
    pub display_name: String,
    /// Owned nodes
    pub node_ids: BTreeSet<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl Cluster {
    pub fn new(id: ClusterId, display_name: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            display_name,
            node_ids: BTreeSet::new(),
            created_at: now,
        }
    }
}

/// Device slot capacity of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub device_slots: u32,
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self { device_slots: 8 }
    }
}

/// Host containing devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Parent cluster (back-reference)
    pub cluster_id: ClusterId,
    pub name: String,
    pub capacity: NodeCapacity,
    /// Member devices
    pub device_ids: BTreeSet<DeviceId>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn new(
        id: NodeId,
        cluster_id: ClusterId,
        name: String,
        capacity: NodeCapacity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            cluster_id,
            name,
            capacity,
            device_ids: BTreeSet::new(),
            created_at: now,
        }
    }

    /// Whether another device fits in this node
    pub fn has_free_slot(&self) -> bool {
        (self.device_ids.len() as u64) < u64::from(self.capacity.device_slots)
    }
}

/// GPU vendor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    #[default]
    Unknown,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuVendor::Nvidia => write!(f, "NVIDIA"),
            GpuVendor::Amd => write!(f, "AMD"),
            GpuVendor::Intel => write!(f, "Intel"),
            GpuVendor::Apple => write!(f, "Apple"),
            GpuVendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Static hardware description of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareDescriptor {
    /// Model name (e.g. "A100-SXM4-80GB")
    pub model: String,
    #[serde(default)]
    pub vendor: GpuVendor,
    /// Total memory in bytes
    pub memory_bytes: u64,
    /// Index within the node
    pub index: u32,
}

/// A single allocatable GPU
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    /// Parent node, `None` while detached
    pub node_id: Option<NodeId>,
    pub hardware: HardwareDescriptor,
    /// Status and holder, updated together
    pub allocation: Allocation,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Create a detached device. It becomes Free once added to a node.
    pub fn new(id: DeviceId, hardware: HardwareDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            node_id: None,
            hardware,
            allocation: Allocation::Offline,
            updated_at: now,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.allocation.status()
    }

    pub fn holder(&self) -> Option<&ConsumerId> {
        self.allocation.holder()
    }
}

/// Required device attributes for an allocation request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelector {
    pub cluster_id: Option<ClusterId>,
    pub node_id: Option<NodeId>,
    /// Minimum memory in bytes
    pub min_memory: Option<u64>,
    /// Exact hardware model
    pub model: Option<String>,
}

impl DeviceSelector {
    /// Match any device
    pub fn any() -> Self {
        Self::default()
    }

    pub fn in_cluster(mut self, cluster_id: impl Into<ClusterId>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn on_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_min_memory(mut self, bytes: u64) -> Self {
        self.min_memory = Some(bytes);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Check the static attributes of a device. `cluster_id` is the cluster of
    /// the device's node, resolved by the caller.
    pub fn matches(&self, device: &Device, cluster_id: Option<&ClusterId>) -> bool {
        if let Some(want) = &self.node_id {
            if device.node_id.as_ref() != Some(want) {
                return false;
            }
        }
        if let Some(want) = &self.cluster_id {
            if cluster_id != Some(want) {
                return false;
            }
        }
        if let Some(min) = self.min_memory {
            if device.hardware.memory_bytes < min {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if &device.hardware.model != model {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(c) = &self.cluster_id {
            parts.push(format!("cluster={}", c));
        }
        if let Some(n) = &self.node_id {
            parts.push(format!("node={}", n));
        }
        if let Some(m) = self.min_memory {
            parts.push(format!("min_memory={}", m));
        }
        if let Some(m) = &self.model {
            parts.push(format!("model={}", m));
        }
        if parts.is_empty() {
            write!(f, "{{any}}")
        } else {
            write!(f, "{{{}}}", parts.join(", "))
        }
    }
}

/// Device counts by status for a node or cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummary {
    pub total: u32,
    pub free: u32,
    pub reserved: u32,
    pub allocated: u32,
    pub offline: u32,
}

impl InventorySummary {
    pub fn count(&mut self, status: DeviceStatus) {
        self.total += 1;
        match status {
            DeviceStatus::Free => self.free += 1,
            DeviceStatus::Reserved => self.reserved += 1,
            DeviceStatus::Allocated => self.allocated += 1,
            DeviceStatus::Offline => self.offline += 1,
        }
    }

    /// Fraction of online devices that are held, in percent
    pub fn utilization(&self) -> f64 {
        let online = self.total - self.offline;
        if online == 0 {
            return 0.0;
        }
        f64::from(self.reserved + self.allocated) / f64::from(online) * 100.0
    }
}
