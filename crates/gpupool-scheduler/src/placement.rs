//! Candidate ordering for allocation requests

use gpupool_core::{ClusterId, DeviceId, NodeId};

/// A Free device matching the request selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub device_id: DeviceId,
    pub cluster_id: ClusterId,
    pub node_id: NodeId,
    /// Index within the node
    pub index: u32,
    pub memory_bytes: u64,
}

/// Placement decision for an allocation attempt
#[derive(Debug, Clone)]
pub struct PlacementDecision {
    /// Devices to reserve, in reservation order
    pub device_ids: Vec<DeviceId>,
}

/// Strategy choosing which candidates an allocation reserves
pub trait PlacementStrategy: Send + Sync {
    /// Pick `count` devices from `candidates`, or `None` if that is not possible.
    ///
    /// Must be deterministic for the same input so retries make the same choice.
    fn place(&self, candidates: Vec<Candidate>, count: usize) -> Option<PlacementDecision>;
}

/// Orders by cluster, then node, then device index and takes the first `count`
pub struct DefaultPlacementStrategy;

impl PlacementStrategy for DefaultPlacementStrategy {
    fn place(&self, mut candidates: Vec<Candidate>, count: usize) -> Option<PlacementDecision> {
        if candidates.len() < count {
            return None;
        }

        candidates.sort_by(|a, b| {
            (&a.cluster_id, &a.node_id, a.index, &a.device_id).cmp(&(
                &b.cluster_id,
                &b.node_id,
                b.index,
                &b.device_id,
            ))
        });

        Some(PlacementDecision {
            device_ids: candidates
                .into_iter()
                .take(count)
                .map(|c| c.device_id)
                .collect(),
        })
    }
}
