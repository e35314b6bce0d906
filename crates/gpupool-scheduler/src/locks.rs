//! Per-device exclusive locks

use gpupool_core::DeviceId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held while transitioning a device
pub type DeviceGuard = OwnedMutexGuard<()>;

/// Table of per-device locks. Every status change of a device happens while
/// holding its lock; there is no global lock across devices.
#[derive(Default)]
pub struct DeviceLocks {
    locks: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock one device
    pub async fn lock(&self, id: &DeviceId) -> DeviceGuard {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Lock several devices in ascending id order, so two callers with
    /// overlapping sets cannot deadlock.
    pub async fn lock_all(&self, ids: &[DeviceId]) -> Vec<DeviceGuard> {
        let mut sorted: Vec<&DeviceId> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock(id).await);
        }
        guards
    }
}
