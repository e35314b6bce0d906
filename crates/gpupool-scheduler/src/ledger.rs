//! Usage ledger: audit records and device/consumer relations
//!
//! Ledger writes are staged into the same [`WriteBatch`] as the device
//! transition they describe, so a committed status change can never be
//! observed without its record, nor a record without its status change.

use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use gpupool_core::{
    Clock, ConsumerId, DeviceId, EntityKind, Outcome, PoolError, PoolResult, RecordQuery,
    RelationQuery, RequestId, TimeRange, TransitionKind, UsageRecord, UsageRelation,
};
use gpupool_store::{Store, WriteBatch};
use std::sync::Arc;
use tracing::debug;

use crate::paging::{paged, PoolStream};

/// Usage ledger over a transactional store
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, page_size: usize) -> Self {
        Self {
            store,
            clock,
            page_size,
        }
    }

    /// Stage an audit record
    pub fn record_event(
        &self,
        batch: &mut WriteBatch,
        device_id: &DeviceId,
        consumer_id: Option<&ConsumerId>,
        event: TransitionKind,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> UsageRecord {
        let record = UsageRecord::new(
            event,
            device_id.clone(),
            consumer_id.cloned(),
            outcome,
            at,
        );
        batch.append_record(record.clone());
        record
    }

    /// Stage opening a relation. The commit fails if one is already open.
    pub fn open_relation(
        &self,
        batch: &mut WriteBatch,
        device_id: &DeviceId,
        consumer_id: &ConsumerId,
        request: Option<RequestId>,
        at: DateTime<Utc>,
    ) -> UsageRelation {
        let relation = UsageRelation::open(device_id.clone(), consumer_id.clone(), request, at);
        batch.open_relation(relation.clone());
        relation
    }

    /// Stage closing the open relation of a device. The commit fails with
    /// `NotFound` if none is open.
    pub fn close_relation(&self, batch: &mut WriteBatch, device_id: &DeviceId, at: DateTime<Utc>) {
        batch.close_relation(device_id.clone(), at);
    }

    /// Stage marking the open relation of a device as committed
    pub fn commit_relation(&self, batch: &mut WriteBatch, device_id: &DeviceId, at: DateTime<Utc>) {
        batch.commit_relation(device_id.clone(), at);
    }

    /// Append a standalone record, for outcomes that change no device state
    pub async fn append(
        &self,
        device_id: &DeviceId,
        consumer_id: Option<&ConsumerId>,
        event: TransitionKind,
        outcome: Outcome,
    ) -> PoolResult<UsageRecord> {
        let mut batch = WriteBatch::new();
        let record = self.record_event(
            &mut batch,
            device_id,
            consumer_id,
            event,
            outcome,
            self.clock.now(),
        );
        self.store.commit(batch).await?;
        debug!(device = %device_id, event = %event, "Appended usage record");
        Ok(record)
    }

    /// The currently open relation of a device
    pub async fn open_relation_for(&self, device_id: &DeviceId) -> PoolResult<UsageRelation> {
        self.store
            .open_relation(device_id)
            .await?
            .ok_or_else(|| PoolError::not_found(EntityKind::Relation, device_id))
    }

    /// Relations of a device or consumer overlapping the query range, by
    /// start time ascending. Restart with [`RelationQuery::resume_after`].
    pub fn list_relations(&self, query: RelationQuery) -> PoolStream<UsageRelation> {
        let store = self.store.clone();
        paged(
            query,
            self.page_size,
            move |query, limit| {
                let store = store.clone();
                async move { Ok(store.list_relations(&query, limit).await?) }
            },
            |query, last| query.resume_after(last),
        )
    }

    /// Records matching the query in append order. Restart with
    /// [`RecordQuery::resume_after`].
    pub fn list_records(&self, query: RecordQuery) -> PoolStream<UsageRecord> {
        let store = self.store.clone();
        paged(
            query,
            self.page_size,
            move |query, limit| {
                let store = store.clone();
                async move { Ok(store.list_records(&query, limit).await?) }
            },
            |query, last| query.resume_after(last),
        )
    }

    /// Total committed holding time of a device inside `range`
    pub async fn utilization(&self, device_id: &DeviceId, range: TimeRange) -> PoolResult<Duration> {
        let now = self.clock.now();
        let relations: Vec<UsageRelation> = self
            .list_relations(RelationQuery::for_device(device_id.clone()).within(range))
            .try_collect()
            .await?;

        Ok(relations
            .iter()
            .filter(|r| r.committed_at.is_some())
            .fold(Duration::zero(), |total, r| total + r.held_within(&range, now)))
    }
}
