//! Usage ledger entries and queries

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::allocation::{RequestId, TransitionKind};
use crate::inventory::{ConsumerId, DeviceId};

/// Result of the operation an audit record describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Immutable audit entry for one device transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    /// Append position, assigned by the store
    #[serde(default)]
    pub seq: u64,
    pub event: TransitionKind,
    pub device_id: DeviceId,
    /// Consumer involved, if any (administrative transitions have none)
    pub consumer_id: Option<ConsumerId>,
    /// Holder before the transition, when it changed hands or was dropped
    #[serde(default)]
    pub previous_consumer_id: Option<ConsumerId>,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
}

impl UsageRecord {
    pub fn new(
        event: TransitionKind,
        device_id: DeviceId,
        consumer_id: Option<ConsumerId>,
        outcome: Outcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            event,
            device_id,
            consumer_id,
            previous_consumer_id: None,
            timestamp,
            outcome,
        }
    }

    pub fn with_previous(mut self, previous: ConsumerId) -> Self {
        self.previous_consumer_id = Some(previous);
        self
    }
}

/// Time-bounded binding of a device to a consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRelation {
    pub id: Uuid,
    pub device_id: DeviceId,
    pub consumer_id: ConsumerId,
    /// Request that reserved the device, if opened by an allocation
    pub request_id: Option<RequestId>,
    pub started_at: DateTime<Utc>,
    /// Set when the reservation was committed to an allocation
    pub committed_at: Option<DateTime<Utc>>,
    /// `None` while open
    pub ended_at: Option<DateTime<Utc>>,
}

impl UsageRelation {
    pub fn open(
        device_id: DeviceId,
        consumer_id: ConsumerId,
        request_id: Option<RequestId>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            consumer_id,
            request_id,
            started_at,
            committed_at: None,
            ended_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Whether the validity interval intersects `range`
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        let starts_before_end = range.end.map_or(true, |end| self.started_at < end);
        let ends_after_start = match (self.ended_at, range.start) {
            (Some(ended), Some(start)) => ended > start,
            _ => true,
        };
        starts_before_end && ends_after_start
    }

    /// Time held inside `range`, treating an open relation as ending at `now`
    pub fn held_within(&self, range: &TimeRange, now: DateTime<Utc>) -> Duration {
        let start = range
            .start
            .map_or(self.started_at, |s| s.max(self.started_at));
        let end = self.ended_at.unwrap_or(now);
        let end = range.end.map_or(end, |e| e.min(end));
        if end > start {
            end - start
        } else {
            Duration::zero()
        }
    }

    pub fn cursor(&self) -> RelationCursor {
        RelationCursor {
            started_at: self.started_at,
            id: self.id,
        }
    }
}

/// Half-open time window `[start, end)`, unbounded on a missing side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at < e)
    }
}

/// Whose relations to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSubject {
    Device(DeviceId),
    Consumer(ConsumerId),
}

/// Resume point in a relation listing, ordered by start time then id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationCursor {
    pub started_at: DateTime<Utc>,
    pub id: Uuid,
}

/// Relation listing query
#[derive(Debug, Clone)]
pub struct RelationQuery {
    pub subject: RelationSubject,
    pub range: TimeRange,
    /// Only relations strictly after this cursor
    pub after: Option<RelationCursor>,
}

impl RelationQuery {
    pub fn for_device(device_id: DeviceId) -> Self {
        Self {
            subject: RelationSubject::Device(device_id),
            range: TimeRange::all(),
            after: None,
        }
    }

    pub fn for_consumer(consumer_id: ConsumerId) -> Self {
        Self {
            subject: RelationSubject::Consumer(consumer_id),
            range: TimeRange::all(),
            after: None,
        }
    }

    pub fn within(mut self, range: TimeRange) -> Self {
        self.range = range;
        self
    }

    /// Restart a listing after the last relation seen
    pub fn resume_after(mut self, last: &UsageRelation) -> Self {
        self.after = Some(last.cursor());
        self
    }

    pub fn matches(&self, relation: &UsageRelation) -> bool {
        let subject = match &self.subject {
            RelationSubject::Device(id) => &relation.device_id == id,
            RelationSubject::Consumer(id) => &relation.consumer_id == id,
        };
        subject
            && relation.overlaps(&self.range)
            && self.after.map_or(true, |after| relation.cursor() > after)
    }
}

/// Record listing query
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub device_id: Option<DeviceId>,
    pub consumer_id: Option<ConsumerId>,
    pub event: Option<TransitionKind>,
    pub range: TimeRange,
    /// Only records with a greater sequence number
    pub after_seq: Option<u64>,
}

impl RecordQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_device(mut self, device_id: DeviceId) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn for_consumer(mut self, consumer_id: ConsumerId) -> Self {
        self.consumer_id = Some(consumer_id);
        self
    }

    pub fn of_event(mut self, event: TransitionKind) -> Self {
        self.event = Some(event);
        self
    }

    pub fn resume_after(mut self, last: &UsageRecord) -> Self {
        self.after_seq = Some(last.seq);
        self
    }

    pub fn matches(&self, record: &UsageRecord) -> bool {
        self.device_id.as_ref().map_or(true, |d| &record.device_id == d)
            && self
                .consumer_id
                .as_ref()
                .map_or(true, |c| record.consumer_id.as_ref() == Some(c))
            && self.event.map_or(true, |e| record.event == e)
            && self.range.contains(record.timestamp)
            && self.after_seq.map_or(true, |seq| record.seq > seq)
    }
}
