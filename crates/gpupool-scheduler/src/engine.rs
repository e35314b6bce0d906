//! Allocation engine
//!
//! Allocation runs in two phases. Candidates are reserved one at a time,
//! each under its own device lock, then every reservation of the request is
//! committed to Allocated in a single store batch. A request that fails,
//! loses a race, or is dropped mid-flight rolls its reservations back to
//! Free; a crashed allocator's reservations are reclaimed by
//! [`AllocationEngine::sweep_stale_reservations`].

use chrono::{DateTime, Utc};
use gpupool_core::{
    Allocation, Clock, ClusterId, ConsumerId, Device, DeviceId, DeviceSelector, DeviceStatus,
    EngineConfig, EntityKind, NodeId, Outcome, PoolError, PoolResult, RequestId, Transition,
    TransitionKind, UsageRecord, UsageRelation,
};
use gpupool_store::{Store, Versioned, WriteBatch};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::inventory::Inventory;
use crate::ledger::UsageLedger;
use crate::locks::DeviceLocks;
use crate::paging::{paged, PoolStream};
use crate::placement::{Candidate, DefaultPlacementStrategy, PlacementStrategy};

/// Which allocations to list; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationFilter {
    pub consumer_id: Option<ConsumerId>,
    pub node_id: Option<NodeId>,
    pub cluster_id: Option<ClusterId>,
}

impl AllocationFilter {
    pub fn for_consumer(mut self, consumer_id: impl Into<ConsumerId>) -> Self {
        self.consumer_id = Some(consumer_id.into());
        self
    }

    pub fn on_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn in_cluster(mut self, cluster_id: impl Into<ClusterId>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }
}

/// A held device as seen by [`AllocationEngine::list_allocations`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationView {
    pub device_id: DeviceId,
    pub node_id: Option<NodeId>,
    pub cluster_id: Option<ClusterId>,
    /// Reserved or Allocated
    pub status: DeviceStatus,
    pub holder: ConsumerId,
    pub since: DateTime<Utc>,
    /// The open relation, absent only if the snapshot raced a commit
    pub relation: Option<UsageRelation>,
}

#[derive(Debug, Clone)]
struct AllocationQuery {
    filter: AllocationFilter,
    after: Option<DeviceId>,
}

/// State shared by the engine and the cleanup tasks it spawns
#[derive(Clone)]
struct Shared {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    locks: Arc<DeviceLocks>,
    ledger: UsageLedger,
    /// Requests currently between their first reservation and their exit
    live: Arc<Mutex<HashSet<RequestId>>>,
}

impl Shared {
    fn is_live(&self, request: RequestId) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&request)
    }

    async fn load_device(&self, id: &DeviceId) -> PoolResult<Versioned<Device>> {
        self.store
            .get_device(id)
            .await?
            .ok_or_else(|| PoolError::not_found(EntityKind::Device, id))
    }

    /// Reserve one Free device still attached to `node_id`. A device that
    /// was claimed or moved since the snapshot yields `Conflict`.
    async fn reserve(
        &self,
        candidate: &Candidate,
        consumer: &ConsumerId,
        request: RequestId,
    ) -> PoolResult<()> {
        let id = &candidate.device_id;
        let _guard = self.locks.lock(id).await;
        let Versioned {
            version,
            value: mut device,
        } = self.load_device(id).await?;

        if device.status() != DeviceStatus::Free || device.node_id.as_ref() != Some(&candidate.node_id)
        {
            return Err(PoolError::conflict(
                format!("device {}", id),
                device.status(),
                "device was claimed concurrently",
            ));
        }

        let now = self.clock.now();
        device.apply(
            &Transition::Reserve {
                holder: consumer.clone(),
                request,
                at: now,
            },
            now,
        )?;

        let mut batch = WriteBatch::new();
        batch.update_device(version, device);
        self.ledger
            .open_relation(&mut batch, id, consumer, Some(request), now);
        self.ledger.record_event(
            &mut batch,
            id,
            Some(consumer),
            TransitionKind::Reserve,
            Outcome::Success,
            now,
        );
        self.store.commit(batch).await?;

        debug!(device_id = %id, consumer = %consumer, request = %request, "Reserved device");
        Ok(())
    }

    /// Move every reservation of `request` to Allocated in one batch
    async fn commit_reservations(
        &self,
        consumer: &ConsumerId,
        request: RequestId,
        ids: &[DeviceId],
    ) -> PoolResult<()> {
        let _guards = self.locks.lock_all(ids).await;
        let now = self.clock.now();
        let mut batch = WriteBatch::new();

        for id in ids {
            let Versioned {
                version,
                value: mut device,
            } = self.load_device(id).await?;
            if !device.allocation.is_reserved_by(request) {
                return Err(PoolError::conflict(
                    format!("device {}", id),
                    device.status(),
                    "reservation was reclaimed before commit",
                ));
            }
            device.apply(&Transition::Allocate { at: now }, now)?;

            batch.update_device(version, device);
            self.ledger.commit_relation(&mut batch, id, now);
            self.ledger.record_event(
                &mut batch,
                id,
                Some(consumer),
                TransitionKind::Allocate,
                Outcome::Success,
                now,
            );
        }

        self.store.commit(batch).await?;
        Ok(())
    }

    /// Return one reservation of `request` to Free with a failure record.
    /// Returns false if the device no longer carries that reservation.
    async fn free_reservation(
        &self,
        id: &DeviceId,
        request: RequestId,
        transition: Transition,
        reason: &str,
    ) -> PoolResult<bool> {
        let _guard = self.locks.lock(id).await;
        let Some(Versioned {
            version,
            value: mut device,
        }) = self.store.get_device(id).await?
        else {
            return Ok(false);
        };
        if !device.allocation.is_reserved_by(request) {
            return Ok(false);
        }

        let holder = device.holder().cloned();
        let now = self.clock.now();
        device.apply(&transition, now)?;

        let mut batch = WriteBatch::new();
        batch.update_device(version, device);
        self.ledger.close_relation(&mut batch, id, now);
        self.ledger.record_event(
            &mut batch,
            id,
            holder.as_ref(),
            transition.kind(),
            Outcome::failure(reason),
            now,
        );
        self.store.commit(batch).await?;
        Ok(true)
    }

    /// Roll back every reservation still held by `request`
    async fn rollback(&self, request: RequestId, reason: &str) -> PoolResult<usize> {
        let reserved: Vec<DeviceId> = self
            .store
            .list_devices()
            .await?
            .into_iter()
            .filter(|d| d.value.allocation.is_reserved_by(request))
            .map(|d| d.value.id)
            .collect();

        let mut freed = 0;
        for id in &reserved {
            if self
                .free_reservation(id, request, Transition::Rollback, reason)
                .await?
            {
                debug!(device_id = %id, request = %request, reason, "Rolled back reservation");
                freed += 1;
            }
        }
        Ok(freed)
    }
}

/// Keeps a request registered as live and rolls back its reservations if
/// the allocating future is dropped before it finishes.
struct ReservationGuard {
    shared: Shared,
    request: RequestId,
    armed: bool,
}

impl ReservationGuard {
    fn new(shared: Shared, request: RequestId) -> Self {
        shared
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request);
        Self {
            shared,
            request,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        self.shared
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.request);

        if !self.armed {
            return;
        }

        let request = self.request;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(request = %request, "Allocation abandoned, rolling back reservations");
                let shared = self.shared.clone();
                handle.spawn(async move {
                    if let Err(e) = shared.rollback(request, "request cancelled").await {
                        warn!(request = %request, error = %e, "Rollback of cancelled request failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    request = %request,
                    "No runtime to roll back abandoned reservations; leaving them to the sweeper"
                );
            }
        }
    }
}

/// Allocation engine over a transactional store
pub struct AllocationEngine {
    shared: Shared,
    inventory: Inventory,
    placement: Arc<dyn PlacementStrategy>,
    config: EngineConfig,
}

impl AllocationEngine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        let locks = Arc::new(DeviceLocks::new());
        let ledger = UsageLedger::new(store.clone(), clock.clone(), config.list_page_size);
        let inventory = Inventory::new(store.clone(), clock.clone(), locks.clone(), ledger.clone());

        Self {
            shared: Shared {
                store,
                clock,
                locks,
                ledger,
                live: Arc::new(Mutex::new(HashSet::new())),
            },
            inventory,
            placement: Arc::new(DefaultPlacementStrategy),
            config,
        }
    }

    /// Replace the candidate ordering strategy
    pub fn with_placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    /// Administrative inventory operations, sharing this engine's device locks
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.shared.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Free devices matching `selector` in the current snapshot
    async fn candidates(&self, selector: &DeviceSelector) -> PoolResult<Vec<Candidate>> {
        let clusters: HashMap<NodeId, ClusterId> = self
            .shared
            .store
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| (n.value.id, n.value.cluster_id))
            .collect();

        Ok(self
            .shared
            .store
            .list_devices()
            .await?
            .into_iter()
            .filter_map(|Versioned { value: device, .. }| {
                if device.status() != DeviceStatus::Free {
                    return None;
                }
                let node_id = device.node_id.clone()?;
                let cluster_id = clusters.get(&node_id)?.clone();
                if !selector.matches(&device, Some(&cluster_id)) {
                    return None;
                }
                Some(Candidate {
                    device_id: device.id,
                    cluster_id,
                    node_id,
                    index: device.hardware.index,
                    memory_bytes: device.hardware.memory_bytes,
                })
            })
            .collect())
    }

    /// Bind `count` devices matching `selector` to `consumer`, all or nothing.
    ///
    /// Fails with `InsufficientResources` when not enough Free devices match,
    /// including after losing races to concurrent requests on every attempt.
    /// Dropping the returned future rolls back any reservations it made.
    pub async fn allocate(
        &self,
        consumer: &ConsumerId,
        selector: &DeviceSelector,
        count: usize,
    ) -> PoolResult<Vec<DeviceId>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let request = RequestId::new();
        let mut guard = ReservationGuard::new(self.shared.clone(), request);

        let result = self.try_allocate(consumer, selector, count, request).await;
        if let Err(e) = &result {
            if let Err(rollback_err) = self.shared.rollback(request, &e.to_string()).await {
                warn!(request = %request, error = %rollback_err, "Rollback failed; sweeper will reclaim");
            }
        }
        guard.disarm();
        result
    }

    async fn try_allocate(
        &self,
        consumer: &ConsumerId,
        selector: &DeviceSelector,
        count: usize,
        request: RequestId,
    ) -> PoolResult<Vec<DeviceId>> {
        let attempts = self.config.max_allocation_attempts.max(1);
        let mut available = 0;

        for attempt in 1..=attempts {
            let candidates = self.candidates(selector).await?;
            available = candidates.len();
            let by_id: HashMap<DeviceId, Candidate> = candidates
                .iter()
                .map(|c| (c.device_id.clone(), c.clone()))
                .collect();

            let Some(decision) = self.placement.place(candidates, count) else {
                break;
            };

            let mut reserved = Vec::with_capacity(count);
            let mut lost_race = false;
            for id in &decision.device_ids {
                let Some(candidate) = by_id.get(id) else {
                    return Err(PoolError::Store(format!(
                        "placement chose {} which is not a candidate",
                        id
                    )));
                };
                match self.shared.reserve(candidate, consumer, request).await {
                    Ok(()) => reserved.push(id.clone()),
                    Err(PoolError::Conflict { .. }) => {
                        lost_race = true;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            if !lost_race {
                self.shared
                    .commit_reservations(consumer, request, &reserved)
                    .await?;
                info!(
                    consumer = %consumer,
                    selector = %selector,
                    devices = ?reserved,
                    attempt,
                    "Allocated devices"
                );
                return Ok(reserved);
            }

            warn!(
                consumer = %consumer,
                attempt,
                reserved = reserved.len(),
                requested = count,
                "Lost reservation race, retrying from a fresh snapshot"
            );
            self.shared.rollback(request, "lost reservation race").await?;
        }

        Err(PoolError::InsufficientResources {
            requested: count,
            available,
            selector: selector.to_string(),
        })
    }

    /// Return devices held by `consumer` to Free. Already Free or Offline
    /// devices are skipped, so a retried release succeeds.
    ///
    /// All devices are checked before any is released: a device held by
    /// someone else fails the whole call with `PermissionDenied`.
    pub async fn release(&self, consumer: &ConsumerId, device_ids: &[DeviceId]) -> PoolResult<()> {
        let ids: BTreeSet<DeviceId> = device_ids.iter().cloned().collect();
        let ids: Vec<DeviceId> = ids.into_iter().collect();
        let _guards = self.shared.locks.lock_all(&ids).await;

        let now = self.shared.clock.now();
        let mut batch = WriteBatch::new();
        let mut released = Vec::new();

        for id in &ids {
            let Versioned {
                version,
                value: mut device,
            } = self.shared.load_device(id).await?;

            match device.holder() {
                None => continue,
                Some(holder) if holder != consumer => {
                    let holder = holder.clone();
                    if let Err(e) = self
                        .shared
                        .ledger
                        .append(
                            id,
                            Some(consumer),
                            TransitionKind::Release,
                            Outcome::failure(format!("device is held by {}", holder)),
                        )
                        .await
                    {
                        warn!(device_id = %id, error = %e, "Failed to record denied release");
                    }
                    return Err(PoolError::PermissionDenied {
                        device: id.clone(),
                        consumer: consumer.clone(),
                        holder: Some(holder),
                    });
                }
                Some(_) => {}
            }

            device.apply(&Transition::Release, now)?;
            batch.update_device(version, device);
            self.shared.ledger.close_relation(&mut batch, id, now);
            self.shared.ledger.record_event(
                &mut batch,
                id,
                Some(consumer),
                TransitionKind::Release,
                Outcome::Success,
                now,
            );
            released.push(id.clone());
        }

        self.shared.store.commit(batch).await?;

        if !released.is_empty() {
            info!(consumer = %consumer, devices = ?released, "Released devices");
        }
        Ok(())
    }

    /// Hand an allocated device from `from` to `to` without a Free window
    pub async fn reassign(
        &self,
        device_id: &DeviceId,
        from: &ConsumerId,
        to: &ConsumerId,
    ) -> PoolResult<()> {
        let _guard = self.shared.locks.lock(device_id).await;
        let Versioned {
            version,
            value: mut device,
        } = self.shared.load_device(device_id).await?;

        if let Some(holder) = device.holder() {
            if holder != from {
                return Err(PoolError::PermissionDenied {
                    device: device_id.clone(),
                    consumer: from.clone(),
                    holder: Some(holder.clone()),
                });
            }
        }
        if from == to && device.status() == DeviceStatus::Allocated {
            return Ok(());
        }

        let now = self.shared.clock.now();
        device.apply(
            &Transition::Reassign {
                to: to.clone(),
                at: now,
            },
            now,
        )?;

        let mut batch = WriteBatch::new();
        batch.update_device(version, device);
        let ledger = &self.shared.ledger;
        ledger.close_relation(&mut batch, device_id, now);
        ledger.open_relation(&mut batch, device_id, to, None, now);
        ledger.commit_relation(&mut batch, device_id, now);
        batch.append_record(
            UsageRecord::new(
                TransitionKind::Reassign,
                device_id.clone(),
                Some(to.clone()),
                Outcome::Success,
                now,
            )
            .with_previous(from.clone()),
        );
        self.shared.store.commit(batch).await?;

        info!(device_id = %device_id, from = %from, to = %to, "Reassigned device");
        Ok(())
    }

    /// Reserved and Allocated devices matching `filter`, ordered by device
    /// id. Lazy; each page is read from a fresh snapshot.
    pub fn list_allocations(&self, filter: AllocationFilter) -> PoolStream<AllocationView> {
        self.allocation_stream(AllocationQuery {
            filter,
            after: None,
        })
    }

    /// Continue a listing after the last view seen
    pub fn list_allocations_after(
        &self,
        filter: AllocationFilter,
        last: &AllocationView,
    ) -> PoolStream<AllocationView> {
        self.allocation_stream(AllocationQuery {
            filter,
            after: Some(last.device_id.clone()),
        })
    }

    fn allocation_stream(&self, query: AllocationQuery) -> PoolStream<AllocationView> {
        let store = self.shared.store.clone();
        paged(
            query,
            self.config.list_page_size,
            move |query, limit| allocation_page(store.clone(), query, limit),
            |mut query, last| {
                query.after = Some(last.device_id.clone());
                query
            },
        )
    }

    /// Expire reservations older than the configured timeout whose request
    /// is no longer in flight. Returns the number of devices freed.
    pub async fn sweep_stale_reservations(&self) -> PoolResult<usize> {
        let now = self.shared.clock.now();
        // A timeout beyond chrono's range never expires anything
        let Some(timeout) = i64::try_from(self.config.reservation_timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
        else {
            return Ok(0);
        };

        let stale: Vec<(DeviceId, RequestId)> = self
            .shared
            .store
            .list_devices()
            .await?
            .into_iter()
            .filter_map(|d| match d.value.allocation {
                Allocation::Reserved { request, since, .. }
                    if now - since >= timeout && !self.shared.is_live(request) =>
                {
                    Some((d.value.id, request))
                }
                _ => None,
            })
            .collect();

        let mut swept = 0;
        for (id, request) in stale {
            if self
                .shared
                .free_reservation(&id, request, Transition::Expire, "reservation timed out")
                .await?
            {
                warn!(device_id = %id, request = %request, "Expired stale reservation");
                swept += 1;
            }
        }
        Ok(swept)
    }
}

async fn allocation_page(
    store: Arc<dyn Store>,
    query: AllocationQuery,
    limit: usize,
) -> PoolResult<Vec<AllocationView>> {
    let filter = &query.filter;
    let clusters: HashMap<NodeId, ClusterId> = store
        .list_nodes()
        .await?
        .into_iter()
        .map(|n| (n.value.id, n.value.cluster_id))
        .collect();

    let mut devices = store.list_devices().await?;
    devices.sort_by(|a, b| a.value.id.cmp(&b.value.id));

    let mut views = Vec::new();
    for Versioned { value: device, .. } in devices {
        if views.len() >= limit {
            break;
        }
        if query.after.as_ref().is_some_and(|after| &device.id <= after) {
            continue;
        }
        let (Some(holder), Some(since)) = (device.holder().cloned(), device.allocation.since())
        else {
            continue;
        };
        let cluster_id = device
            .node_id
            .as_ref()
            .and_then(|n| clusters.get(n))
            .cloned();

        if filter.consumer_id.as_ref().is_some_and(|c| c != &holder)
            || filter
                .node_id
                .as_ref()
                .is_some_and(|n| device.node_id.as_ref() != Some(n))
            || filter
                .cluster_id
                .as_ref()
                .is_some_and(|c| cluster_id.as_ref() != Some(c))
        {
            continue;
        }

        let relation = store.open_relation(&device.id).await?;
        views.push(AllocationView {
            status: device.status(),
            device_id: device.id,
            node_id: device.node_id,
            cluster_id,
            holder,
            since,
            relation,
        });
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;
    use crate::placement::PlacementDecision;
    use gpupool_core::{GpuVendor, HardwareDescriptor, ManualClock, NodeCapacity, RecordQuery};
    use gpupool_store::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<AllocationEngine>,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    fn hardware(index: u32, memory_gb: u64) -> HardwareDescriptor {
        HardwareDescriptor {
            model: "A100".to_string(),
            vendor: GpuVendor::Nvidia,
            memory_bytes: memory_gb << 30,
            index,
        }
    }

    /// Cluster c1 with node n1 holding d1..=d`devices`
    async fn fixture(devices: u32) -> Fixture {
        let config = EngineConfig {
            list_page_size: 2,
            ..EngineConfig::default()
        };
        fixture_with(devices, config, None).await
    }

    async fn fixture_with(
        devices: u32,
        config: EngineConfig,
        placement: Option<Arc<dyn PlacementStrategy>>,
    ) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        let mut engine = AllocationEngine::new(store.clone(), clock.clone(), config);
        if let Some(placement) = placement {
            engine = engine.with_placement(placement);
        }
        let engine = Arc::new(engine);

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
        for i in 1..=devices {
            inventory
                .add_device_to_node(
                    &NodeId::from("n1"),
                    DeviceId::new(format!("d{}", i)),
                    hardware(i - 1, 80),
                )
                .await
                .unwrap();
        }

        Fixture {
            engine,
            store,
            clock,
        }
    }

    fn on_n1() -> DeviceSelector {
        DeviceSelector::any().on_node("n1")
    }

    async fn status(store: &MemoryStore, id: &str) -> DeviceStatus {
        store
            .get_device(&DeviceId::from(id))
            .await
            .unwrap()
            .unwrap()
            .value
            .status()
    }

    /// Holder defined exactly when Reserved or Allocated, and an open
    /// relation exists for exactly those devices, to the same consumer.
    async fn assert_consistent(store: &MemoryStore) {
        for Versioned { value: device, .. } in store.list_devices().await.unwrap() {
            let held = matches!(device.status(), DeviceStatus::Reserved | DeviceStatus::Allocated);
            assert_eq!(device.holder().is_some(), held, "device {}", device.id);

            let open = store.open_relation(&device.id).await.unwrap();
            assert_eq!(
                open.map(|r| r.consumer_id),
                device.holder().cloned(),
                "device {}",
                device.id
            );
        }
    }

    async fn records(engine: &AllocationEngine, query: RecordQuery) -> Vec<UsageRecord> {
        engine.ledger().list_records(query).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_allocate_then_insufficient() {
        let f = fixture(2).await;
        let job7 = ConsumerId::from("job-7");

        let devices = f.engine.allocate(&job7, &on_n1(), 2).await.unwrap();
        assert_eq!(devices, vec![DeviceId::from("d1"), DeviceId::from("d2")]);
        assert_eq!(status(&f.store, "d1").await, DeviceStatus::Allocated);
        assert_eq!(status(&f.store, "d2").await, DeviceStatus::Allocated);

        let allocations = records(
            &f.engine,
            RecordQuery::all()
                .for_consumer(job7.clone())
                .of_event(TransitionKind::Allocate),
        )
        .await;
        assert_eq!(allocations.len(), 2);

        for id in ["d1", "d2"] {
            let relation = f
                .engine
                .ledger()
                .open_relation_for(&DeviceId::from(id))
                .await
                .unwrap();
            assert_eq!(relation.consumer_id, job7);
            assert!(relation.committed_at.is_some());
        }

        let err = f
            .engine
            .allocate(&ConsumerId::from("job-8"), &on_n1(), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::InsufficientResources {
                requested: 1,
                available: 0,
                ..
            }
        ));
        assert!(err.is_retryable());
        assert_consistent(&f.store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_simultaneous_requests_do_not_block() {
        let f = fixture(2).await;

        let a = {
            let engine = f.engine.clone();
            tokio::spawn(async move {
                engine
                    .allocate(&ConsumerId::from("job-7"), &on_n1(), 2)
                    .await
            })
        };
        let b = {
            let engine = f.engine.clone();
            tokio::spawn(async move {
                engine
                    .allocate(&ConsumerId::from("job-8"), &on_n1(), 1)
                    .await
            })
        };

        let (a, b) = tokio::time::timeout(Duration::from_secs(5), async {
            (a.await.unwrap(), b.await.unwrap())
        })
        .await
        .expect("allocations blocked");

        let bound = a.as_ref().map_or(0, Vec::len) + b.as_ref().map_or(0, Vec::len);
        assert!(bound <= 2);
        assert!(a.is_ok() || b.is_ok());
        for result in [&a, &b] {
            if let Err(e) = result {
                assert!(matches!(e, PoolError::InsufficientResources { .. }));
            }
        }
        assert_consistent(&f.store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_double_allocate() {
        let f = fixture(5).await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let engine = f.engine.clone();
            tasks.push(tokio::spawn(async move {
                let consumer = ConsumerId::new(format!("job-{}", i));
                engine
                    .allocate(&consumer, &DeviceSelector::any(), 2)
                    .await
                    .map(|devices| (consumer, devices))
            }));
        }

        let mut bound: Vec<DeviceId> = Vec::new();
        for task in tasks {
            match task.await.unwrap() {
                Ok((consumer, devices)) => {
                    assert_eq!(devices.len(), 2);
                    for id in &devices {
                        let device = f.store.get_device(id).await.unwrap().unwrap().value;
                        assert_eq!(device.holder(), Some(&consumer));
                    }
                    bound.extend(devices);
                }
                Err(e) => assert!(matches!(e, PoolError::InsufficientResources { .. })),
            }
        }

        assert!(bound.len() <= 5);
        let unique: HashSet<&DeviceId> = bound.iter().collect();
        assert_eq!(unique.len(), bound.len());

        let reserved = f
            .store
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.value.status() == DeviceStatus::Reserved)
            .count();
        assert_eq!(reserved, 0);
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_release_returns_devices_and_is_idempotent() {
        let f = fixture(3).await;
        let job7 = ConsumerId::from("job-7");

        let devices = f.engine.allocate(&job7, &on_n1(), 3).await.unwrap();
        f.engine.release(&job7, &devices).await.unwrap();

        for id in ["d1", "d2", "d3"] {
            assert_eq!(status(&f.store, id).await, DeviceStatus::Free);
        }
        let open: Vec<UsageRelation> = f
            .engine
            .ledger()
            .list_relations(gpupool_core::RelationQuery::for_consumer(job7.clone()))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(open.len(), 3);
        assert!(open.iter().all(|r| !r.is_open()));

        let before = records(&f.engine, RecordQuery::all()).await.len();
        f.engine.release(&job7, &devices).await.unwrap();
        assert_eq!(records(&f.engine, RecordQuery::all()).await.len(), before);
        for id in ["d1", "d2", "d3"] {
            assert_eq!(status(&f.store, id).await, DeviceStatus::Free);
        }
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_denied() {
        let f = fixture(2).await;
        let job7 = ConsumerId::from("job-7");
        let job8 = ConsumerId::from("job-8");

        f.engine.allocate(&job7, &on_n1(), 1).await.unwrap();
        let devices = f.engine.allocate(&job8, &on_n1(), 1).await.unwrap();
        assert_eq!(devices, vec![DeviceId::from("d2")]);

        // One device of the batch belongs to someone else: nothing is released
        let err = f
            .engine
            .release(&job8, &[DeviceId::from("d1"), DeviceId::from("d2")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PoolError::PermissionDenied {
                holder: Some(ref h),
                ..
            } if h == &job7
        ));
        assert_eq!(status(&f.store, "d2").await, DeviceStatus::Allocated);

        let denied = records(
            &f.engine,
            RecordQuery::all()
                .for_consumer(job8.clone())
                .of_event(TransitionKind::Release),
        )
        .await;
        assert_eq!(denied.len(), 1);
        assert!(!denied[0].outcome.is_success());

        let err = f
            .engine
            .release(&job7, &[DeviceId::from("d9")])
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_reassign_moves_holder_without_free_window() {
        let f = fixture(1).await;
        let d1 = DeviceId::from("d1");
        let job7 = ConsumerId::from("job-7");
        let job8 = ConsumerId::from("job-8");

        f.engine.allocate(&job7, &on_n1(), 1).await.unwrap();
        f.clock.advance(Duration::from_secs(10));

        let err = f.engine.reassign(&d1, &job8, &job7).await.unwrap_err();
        assert!(matches!(err, PoolError::PermissionDenied { .. }));

        f.engine.reassign(&d1, &job7, &job8).await.unwrap();
        let device = f.store.get_device(&d1).await.unwrap().unwrap().value;
        assert_eq!(device.status(), DeviceStatus::Allocated);
        assert_eq!(device.holder(), Some(&job8));

        let relation = f.engine.ledger().open_relation_for(&d1).await.unwrap();
        assert_eq!(relation.consumer_id, job8);

        let reassigns = records(&f.engine, RecordQuery::all().of_event(TransitionKind::Reassign)).await;
        assert_eq!(reassigns.len(), 1);
        assert_eq!(reassigns[0].previous_consumer_id, Some(job7.clone()));

        let used = f
            .engine
            .ledger()
            .utilization(&d1, gpupool_core::TimeRange::all())
            .await
            .unwrap();
        assert_eq!(used, chrono::Duration::seconds(10));

        // A Free device cannot be reassigned
        f.engine.release(&job8, &[d1.clone()]).await.unwrap();
        let err = f.engine.reassign(&d1, &job8, &job7).await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidTransition { .. }));
        assert!(!err.is_retryable());
        assert_consistent(&f.store).await;
    }

    #[tokio::test]
    async fn test_allocated_device_cannot_be_removed() {
        let f = fixture(2).await;
        let n1 = NodeId::from("n1");

        f.engine
            .allocate(&ConsumerId::from("job-7"), &on_n1(), 1)
            .await
            .unwrap();

        let err = f
            .engine
            .inventory()
            .remove_device_from_node(&n1, &DeviceId::from("d1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Conflict { .. }));

        f.engine
            .inventory()
            .remove_device_from_node(&n1, &DeviceId::from("d2"))
            .await
            .unwrap();
        let remaining: Vec<DeviceId> = f
            .engine
            .inventory()
            .list_devices_by_node(&n1)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(remaining, vec![DeviceId::from("d1")]);

        // The detached device is no longer a candidate
        let err = f
            .engine
            .allocate(&ConsumerId::from("job-8"), &DeviceSelector::any(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InsufficientResources { .. }));
    }

    #[tokio::test]
    async fn test_selector_filters_memory_and_model() {
        let f = fixture(1).await;
        f.engine
            .inventory()
            .add_device_to_node(&NodeId::from("n1"), DeviceId::from("small"), hardware(5, 16))
            .await
            .unwrap();

        let big = DeviceSelector::any().with_min_memory(40 << 30);
        let devices = f
            .engine
            .allocate(&ConsumerId::from("job-1"), &big, 1)
            .await
            .unwrap();
        assert_eq!(devices, vec![DeviceId::from("d1")]);
        assert!(f
            .engine
            .allocate(&ConsumerId::from("job-2"), &big, 1)
            .await
            .is_err());

        let h100 = DeviceSelector::any().with_model("H100");
        assert!(f
            .engine
            .allocate(&ConsumerId::from("job-2"), &h100, 1)
            .await
            .is_err());

        let devices = f
            .engine
            .allocate(&ConsumerId::from("job-2"), &DeviceSelector::any().in_cluster("c1"), 1)
            .await
            .unwrap();
        assert_eq!(devices, vec![DeviceId::from("small")]);
    }

    #[tokio::test]
    async fn test_every_transition_has_one_record() {
        let f = fixture(2).await;
        let job7 = ConsumerId::from("job-7");

        let devices = f.engine.allocate(&job7, &on_n1(), 2).await.unwrap();
        f.engine.release(&job7, &devices).await.unwrap();
        f.engine
            .inventory()
            .set_device_offline(&DeviceId::from("d1"))
            .await
            .unwrap();

        // attach, reserve, allocate, release, plus drain on d1
        let d1 = records(&f.engine, RecordQuery::all().for_device(DeviceId::from("d1"))).await;
        let events: Vec<TransitionKind> = d1.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                TransitionKind::Attach,
                TransitionKind::Reserve,
                TransitionKind::Allocate,
                TransitionKind::Release,
                TransitionKind::Drain,
            ]
        );
        let d2 = records(&f.engine, RecordQuery::all().for_device(DeviceId::from("d2"))).await;
        assert_eq!(d2.len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_allocation_rolls_back() {
        let f = fixture(2).await;

        // Block the second reservation so the request is cancelled mid-flight
        let blocker = f.engine.shared.locks.lock(&DeviceId::from("d2")).await;
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            f.engine.allocate(&ConsumerId::from("job-7"), &on_n1(), 2),
        )
        .await;
        assert!(result.is_err());
        drop(blocker);

        for _ in 0..100 {
            if status(&f.store, "d1").await == DeviceStatus::Free {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status(&f.store, "d1").await, DeviceStatus::Free);
        assert_eq!(status(&f.store, "d2").await, DeviceStatus::Free);

        let rollbacks = records(&f.engine, RecordQuery::all().of_event(TransitionKind::Rollback)).await;
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].device_id, DeviceId::from("d1"));
        assert!(f.engine.shared.live.lock().unwrap().is_empty());
        assert_consistent(&f.store).await;
    }

    /// Leave a reservation behind as a crashed allocator would
    async fn orphan_reservation(f: &Fixture, id: &str) {
        let stored = f.store.get_device(&DeviceId::from(id)).await.unwrap().unwrap();
        let mut device = stored.value;
        let now = f.clock.now();
        let holder = ConsumerId::from("job-crashed");
        let request = RequestId::new();
        device
            .apply(
                &Transition::Reserve {
                    holder: holder.clone(),
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
                DeviceId::from(id),
                holder.clone(),
                Some(request),
                now,
            ))
            .append_record(UsageRecord::new(
                TransitionKind::Reserve,
                DeviceId::from(id),
                Some(holder),
                Outcome::Success,
                now,
            ));
        f.store.commit(batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_expires_stale_reservations() {
        let f = fixture(2).await;
        orphan_reservation(&f, "d1").await;

        f.clock.advance(Duration::from_secs(29));
        assert_eq!(f.engine.sweep_stale_reservations().await.unwrap(), 0);
        assert_eq!(status(&f.store, "d1").await, DeviceStatus::Reserved);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.engine.sweep_stale_reservations().await.unwrap(), 1);
        assert_eq!(status(&f.store, "d1").await, DeviceStatus::Free);

        let expired = records(&f.engine, RecordQuery::all().of_event(TransitionKind::Expire)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].consumer_id, Some(ConsumerId::from("job-crashed")));
        assert_consistent(&f.store).await;

        // The reclaimed device is allocatable again
        let devices = f
            .engine
            .allocate(&ConsumerId::from("job-7"), &on_n1(), 2)
            .await
            .unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_with_unbounded_timeout_never_expires() {
        for timeout in [100_000_000_000_000_000, u64::MAX] {
            let config = EngineConfig {
                reservation_timeout_secs: timeout,
                ..EngineConfig::default()
            };
            let f = fixture_with(1, config, None).await;
            orphan_reservation(&f, "d1").await;

            f.clock.advance(Duration::from_secs(365 * 24 * 3600));
            assert_eq!(f.engine.sweep_stale_reservations().await.unwrap(), 0);
            assert_eq!(status(&f.store, "d1").await, DeviceStatus::Reserved);
        }
    }

    #[tokio::test]
    async fn test_reserve_refuses_device_moved_to_another_node() {
        let f = fixture(1).await;
        let inventory = f.engine.inventory();
        inventory
            .create_node(
                &ClusterId::from("c1"),
                NodeId::from("n2"),
                "n2",
                NodeCapacity::default(),
            )
            .await
            .unwrap();

        // Candidate taken while d1 sat on n1
        let candidate = f
            .engine
            .candidates(&on_n1())
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(candidate.node_id, NodeId::from("n1"));

        inventory
            .remove_device_from_node(&NodeId::from("n1"), &DeviceId::from("d1"))
            .await
            .unwrap();
        inventory
            .add_device_to_node(&NodeId::from("n2"), DeviceId::from("d1"), hardware(0, 80))
            .await
            .unwrap();
        assert_eq!(status(&f.store, "d1").await, DeviceStatus::Free);

        let err = f
            .engine
            .shared
            .reserve(&candidate, &ConsumerId::from("job-7"), RequestId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Conflict { .. }));
        assert_eq!(status(&f.store, "d1").await, DeviceStatus::Free);

        // A fresh request scoped to n1 finds nothing
        let err = f
            .engine
            .allocate(&ConsumerId::from("job-7"), &on_n1(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::InsufficientResources { .. }));
        assert_consistent(&f.store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_membership_changes_race_allocations() {
        let f = fixture(4).await;
        let n1 = NodeId::from("n1");

        let mut allocations = Vec::new();
        for i in 0..6 {
            let engine = f.engine.clone();
            allocations.push(tokio::spawn(async move {
                let consumer = ConsumerId::new(format!("job-{}", i));
                engine
                    .allocate(&consumer, &on_n1(), 1)
                    .await
                    .map(|devices| (consumer, devices))
            }));
        }
        let mut removals = Vec::new();
        for id in ["d1", "d2"] {
            let engine = f.engine.clone();
            let node = n1.clone();
            removals.push(tokio::spawn(async move {
                let id = DeviceId::from(id);
                let result = engine.inventory().remove_device_from_node(&node, &id).await;
                (id, result)
            }));
        }
        let mut drains = Vec::new();
        for id in ["d3", "d4"] {
            let engine = f.engine.clone();
            drains.push(tokio::spawn(async move {
                engine.inventory().set_device_offline(&DeviceId::from(id)).await
            }));
        }

        let mut removed = HashSet::new();
        for task in removals {
            let (id, result) = task.await.unwrap();
            match result {
                Ok(device) => {
                    assert!(device.node_id.is_none());
                    removed.insert(id);
                }
                Err(e) => assert!(matches!(e, PoolError::Conflict { .. })),
            }
        }
        for task in drains {
            if let Err(e) = task.await.unwrap() {
                assert!(matches!(e, PoolError::Conflict { .. }));
            }
        }

        let mut bound: Vec<DeviceId> = Vec::new();
        for task in allocations {
            match task.await.unwrap() {
                Ok((consumer, devices)) => {
                    assert_eq!(devices.len(), 1);
                    let device = f.store.get_device(&devices[0]).await.unwrap().unwrap().value;
                    assert!(!removed.contains(&device.id));
                    // A drain may have taken it back since
                    if let Some(holder) = device.holder() {
                        assert_eq!(holder, &consumer);
                        assert_eq!(device.node_id.as_ref(), Some(&n1));
                    }
                    bound.extend(devices);
                }
                Err(e) => assert!(matches!(e, PoolError::InsufficientResources { .. })),
            }
        }
        let unique: HashSet<&DeviceId> = bound.iter().collect();
        assert_eq!(unique.len(), bound.len());

        let node = f.engine.inventory().get_node(&n1).await.unwrap();
        for Versioned { value: device, .. } in f.store.list_devices().await.unwrap() {
            assert_ne!(device.status(), DeviceStatus::Reserved, "device {}", device.id);
            if removed.contains(&device.id) {
                assert!(device.holder().is_none());
                assert!(!node.device_ids.contains(&device.id));
            } else {
                assert_eq!(device.node_id.as_ref(), Some(&n1));
            }
        }
        assert!(f.engine.shared.live.lock().unwrap().is_empty());
        assert_consistent(&f.store).await;
    }

    /// Prefers the largest memory, then device id
    struct LargestMemoryFirst;

    impl PlacementStrategy for LargestMemoryFirst {
        fn place(&self, mut candidates: Vec<Candidate>, count: usize) -> Option<PlacementDecision> {
            if candidates.len() < count {
                return None;
            }
            candidates.sort_by(|a, b| {
                b.memory_bytes
                    .cmp(&a.memory_bytes)
                    .then_with(|| a.device_id.cmp(&b.device_id))
            });
            Some(PlacementDecision {
                device_ids: candidates.into_iter().take(count).map(|c| c.device_id).collect(),
            })
        }
    }

    #[tokio::test]
    async fn test_custom_placement_strategy() {
        let f = fixture_with(0, EngineConfig::default(), Some(Arc::new(LargestMemoryFirst))).await;
        for (i, memory_gb) in [40, 80, 24].into_iter().enumerate() {
            f.engine
                .inventory()
                .add_device_to_node(
                    &NodeId::from("n1"),
                    DeviceId::new(format!("d{}", i + 1)),
                    hardware(i as u32, memory_gb),
                )
                .await
                .unwrap();
        }

        let devices = f
            .engine
            .allocate(&ConsumerId::from("job-7"), &on_n1(), 2)
            .await
            .unwrap();
        assert_eq!(devices, vec![DeviceId::from("d2"), DeviceId::from("d1")]);
        assert_eq!(status(&f.store, "d3").await, DeviceStatus::Free);
    }

    #[tokio::test]
    async fn test_list_allocations_filters_and_resumes() {
        let f = fixture(5).await;
        let job7 = ConsumerId::from("job-7");
        let job8 = ConsumerId::from("job-8");

        f.engine.allocate(&job7, &on_n1(), 3).await.unwrap();
        f.engine.allocate(&job8, &on_n1(), 1).await.unwrap();

        let all: Vec<AllocationView> = f
            .engine
            .list_allocations(AllocationFilter::default())
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].device_id < w[1].device_id));
        assert!(all.iter().all(|v| v.status == DeviceStatus::Allocated));
        assert!(all.iter().all(|v| v.cluster_id == Some(ClusterId::from("c1"))));
        assert!(all
            .iter()
            .all(|v| v.relation.as_ref().map(|r| &r.consumer_id) == Some(&v.holder)));

        let mine: Vec<AllocationView> = f
            .engine
            .list_allocations(AllocationFilter::default().for_consumer("job-7"))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(mine.len(), 3);

        let rest: Vec<AllocationView> = f
            .engine
            .list_allocations_after(AllocationFilter::default().for_consumer("job-7"), &mine[0])
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rest, mine[1..].to_vec());

        let elsewhere: Vec<AllocationView> = f
            .engine
            .list_allocations(AllocationFilter::default().in_cluster("c2"))
            .try_collect()
            .await
            .unwrap();
        assert!(elsewhere.is_empty());
    }

    #[tokio::test]
    async fn test_allocate_zero_devices() {
        let f = fixture(1).await;
        let devices = f
            .engine
            .allocate(&ConsumerId::from("job-7"), &on_n1(), 0)
            .await
            .unwrap();
        assert!(devices.is_empty());
        assert!(records(&f.engine, RecordQuery::all().of_event(TransitionKind::Reserve))
            .await
            .is_empty());
    }
}
