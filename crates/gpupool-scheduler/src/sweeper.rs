//! Background reclamation of stale reservations

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::engine::AllocationEngine;

/// Periodically runs [`AllocationEngine::sweep_stale_reservations`]
pub struct ReservationSweeper {
    engine: Arc<AllocationEngine>,
    interval: Duration,
}

/// Handle to a running sweeper
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the current pass to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Reservation sweeper task failed");
        }
    }
}

impl ReservationSweeper {
    pub fn new(engine: Arc<AllocationEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Spawn the sweep loop on the current runtime
    pub fn spawn(self) -> SweeperHandle {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(rx).await });
        SweeperHandle { shutdown: tx, task }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.engine.config().reservation_timeout_secs,
            "Starting reservation sweeper"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.engine.sweep_stale_reservations().await {
                        Ok(0) => {}
                        Ok(count) => info!(expired = count, "Sweep pass complete"),
                        Err(e) => error!(error = %e, "Reservation sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reservation sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpupool_core::{
        Clock, ClusterId, ConsumerId, DeviceId, DeviceStatus, EngineConfig, GpuVendor,
        HardwareDescriptor, NodeCapacity, NodeId, RequestId, SystemClock, Transition,
        UsageRelation,
    };
    use gpupool_store::{MemoryStore, Store, WriteBatch};

    async fn device_status(store: &MemoryStore, id: &str) -> DeviceStatus {
        store
            .get_device(&DeviceId::from(id))
            .await
            .unwrap()
            .unwrap()
            .value
            .status()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_after_timeout() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(SystemClock::new());
        let engine = Arc::new(AllocationEngine::new(
            store.clone(),
            clock.clone(),
            EngineConfig::default(),
        ));

        let inventory = engine.inventory();
        inventory
            .create_cluster(ClusterId::from("c1"), "Cluster 1")
            .await
            .unwrap();
        inventory
            .create_node(
                &ClusterId::from("c1"),
                NodeId::from("n1"),
                "n1",
                NodeCapacity::default(),
            )
            .await
            .unwrap();
        inventory
            .add_device_to_node(
                &NodeId::from("n1"),
                DeviceId::from("d1"),
                HardwareDescriptor {
                    model: "A100".to_string(),
                    vendor: GpuVendor::Nvidia,
                    memory_bytes: 80 << 30,
                    index: 0,
                },
            )
            .await
            .unwrap();

        // Reservation left behind by an allocator that never committed
        let stored = store.get_device(&DeviceId::from("d1")).await.unwrap().unwrap();
        let mut device = stored.value;
        let now = clock.now();
        let request = RequestId::new();
        device
            .apply(
                &Transition::Reserve {
                    holder: ConsumerId::from("job-7"),
                    request,
                    at: now,
                },
                now,
            )
            .unwrap();
        let mut batch = WriteBatch::new();
        batch
            .update_device(stored.version, device)
            .open_relation(UsageRelation::open(
                DeviceId::from("d1"),
                ConsumerId::from("job-7"),
                Some(request),
                now,
            ));
        store.commit(batch).await.unwrap();

        let handle = ReservationSweeper::new(engine.clone(), Duration::from_secs(5)).spawn();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(device_status(&store, "d1").await, DeviceStatus::Reserved);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(device_status(&store, "d1").await, DeviceStatus::Free);
        assert!(store.open_relation(&DeviceId::from("d1")).await.unwrap().is_none());

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let engine = Arc::new(AllocationEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock::new()),
            EngineConfig::default(),
        ));
        let handle = ReservationSweeper::new(engine, Duration::from_secs(1)).spawn();
        tokio::time::sleep(Duration::from_secs(3)).await;

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("sweeper did not stop");
    }
}
