//! Startup inventory from the `[[clusters]]` config section

use gpupool_core::{
    parse_memory, ClusterId, ClusterSeed, DeviceId, HardwareDescriptor, NodeCapacity, NodeId,
    PoolError, PoolResult,
};
use gpupool_scheduler::Inventory;
use tracing::{debug, warn};

/// What a seeding pass created
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedStats {
    pub clusters: usize,
    pub nodes: usize,
    pub devices: usize,
}

/// Create the seeded clusters, nodes and devices that do not exist yet.
/// Existing entities are left untouched, so restarting with a snapshot
/// and the same config is a no-op.
pub async fn apply(inventory: &Inventory, seeds: &[ClusterSeed]) -> PoolResult<SeedStats> {
    let mut stats = SeedStats::default();

    for cluster_seed in seeds {
        let cluster_id = ClusterId::new(cluster_seed.id.clone());
        match inventory.get_cluster(&cluster_id).await {
            Ok(_) => debug!(cluster_id = %cluster_id, "Cluster exists, skipping"),
            Err(PoolError::NotFound { .. }) => {
                let name = cluster_seed
                    .display_name
                    .clone()
                    .unwrap_or_else(|| cluster_seed.id.clone());
                inventory.create_cluster(cluster_id.clone(), name).await?;
                stats.clusters += 1;
            }
            Err(e) => return Err(e),
        }

        for node_seed in &cluster_seed.nodes {
            let node_id = NodeId::new(node_seed.id.clone());
            match inventory.get_node(&node_id).await {
                Ok(node) if node.cluster_id != cluster_id => {
                    warn!(
                        node_id = %node_id,
                        cluster_id = %node.cluster_id,
                        "Seeded node belongs to another cluster, skipping"
                    );
                    continue;
                }
                Ok(_) => {}
                Err(PoolError::NotFound { .. }) => {
                    let slots = node_seed
                        .device_slots
                        .unwrap_or_else(|| u32::try_from(node_seed.devices.len()).unwrap_or(u32::MAX));
                    inventory
                        .create_node(
                            &cluster_id,
                            node_id.clone(),
                            node_seed.name.clone().unwrap_or_else(|| node_seed.id.clone()),
                            NodeCapacity {
                                device_slots: slots,
                            },
                        )
                        .await?;
                    stats.nodes += 1;
                }
                Err(e) => return Err(e),
            }

            for device_seed in &node_seed.devices {
                let device_id = DeviceId::new(device_seed.id.clone());
                match inventory.get_device(&device_id).await {
                    Ok(_) => continue,
                    Err(PoolError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }

                let hardware = HardwareDescriptor {
                    model: device_seed.model.clone(),
                    vendor: device_seed.vendor,
                    memory_bytes: parse_memory(&device_seed.memory)?,
                    index: device_seed.index,
                };
                inventory
                    .add_device_to_node(&node_id, device_id, hardware)
                    .await?;
                stats.devices += 1;
            }
        }
    }

    Ok(stats)
}
