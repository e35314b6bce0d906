//! Per-device allocation state machine
//!
//! A device's status and its holder live in a single [`Allocation`] value, so
//! a holder exists exactly when the device is Reserved or Allocated.
//!
//! ```text
//! Free ──reserve──▶ Reserved ──allocate──▶ Allocated ──release──▶ Free
//!                      │  rollback/expire                │ reassign (to another holder)
//!                      └──────────▶ Free                  ▼
//! Free | Allocated ──detach/drain──▶ Offline ──attach/restore──▶ Free
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PoolError, PoolResult};
use crate::inventory::{ConsumerId, Device};

/// Identity of one allocation request, carried by its reservations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Device status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Free,
    Reserved,
    Allocated,
    Offline,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Free => write!(f, "free"),
            DeviceStatus::Reserved => write!(f, "reserved"),
            DeviceStatus::Allocated => write!(f, "allocated"),
            DeviceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Status plus holder of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Allocation {
    Free,
    Reserved {
        holder: ConsumerId,
        request: RequestId,
        since: DateTime<Utc>,
    },
    Allocated {
        holder: ConsumerId,
        since: DateTime<Utc>,
    },
    Offline,
}

impl Allocation {
    pub fn status(&self) -> DeviceStatus {
        match self {
            Allocation::Free => DeviceStatus::Free,
            Allocation::Reserved { .. } => DeviceStatus::Reserved,
            Allocation::Allocated { .. } => DeviceStatus::Allocated,
            Allocation::Offline => DeviceStatus::Offline,
        }
    }

    pub fn holder(&self) -> Option<&ConsumerId> {
        match self {
            Allocation::Reserved { holder, .. } | Allocation::Allocated { holder, .. } => {
                Some(holder)
            }
            Allocation::Free | Allocation::Offline => None,
        }
    }

    /// When the current hold started
    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            Allocation::Reserved { since, .. } | Allocation::Allocated { since, .. } => {
                Some(*since)
            }
            Allocation::Free | Allocation::Offline => None,
        }
    }

    /// Whether this is a reservation taken by `request`
    pub fn is_reserved_by(&self, request: RequestId) -> bool {
        matches!(self, Allocation::Reserved { request: r, .. } if *r == request)
    }

    /// Compute the state after `transition`, or `None` if it is not allowed
    /// from the current state.
    pub fn step(&self, transition: &Transition) -> Option<Allocation> {
        match (self, transition) {
            (Allocation::Free, Transition::Reserve { holder, request, at }) => {
                Some(Allocation::Reserved {
                    holder: holder.clone(),
                    request: *request,
                    since: *at,
                })
            }
            (Allocation::Reserved { holder, .. }, Transition::Allocate { at }) => {
                Some(Allocation::Allocated {
                    holder: holder.clone(),
                    since: *at,
                })
            }
            (Allocation::Reserved { .. }, Transition::Rollback | Transition::Expire) => {
                Some(Allocation::Free)
            }
            (Allocation::Allocated { .. }, Transition::Release) => Some(Allocation::Free),
            (Allocation::Allocated { .. }, Transition::Reassign { to, at }) => {
                Some(Allocation::Allocated {
                    holder: to.clone(),
                    since: *at,
                })
            }
            (Allocation::Free | Allocation::Allocated { .. }, Transition::Detach | Transition::Drain) => {
                Some(Allocation::Offline)
            }
            (Allocation::Offline, Transition::Attach | Transition::Restore) => {
                Some(Allocation::Free)
            }
            _ => None,
        }
    }
}

/// A requested state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Free → Reserved, before the request commits
    Reserve {
        holder: ConsumerId,
        request: RequestId,
        at: DateTime<Utc>,
    },
    /// Reserved → Allocated
    Allocate { at: DateTime<Utc> },
    /// Reserved → Free when the request fails or is cancelled
    Rollback,
    /// Reserved → Free when the reservation outlived its timeout
    Expire,
    /// Allocated → Free
    Release,
    /// Allocated → Allocated with a new holder, no Free window in between
    Reassign { to: ConsumerId, at: DateTime<Utc> },
    /// Free/Allocated → Offline on removal from a node
    Detach,
    /// Free/Allocated → Offline while staying in the node
    Drain,
    /// Offline → Free on (re-)adding to a node
    Attach,
    /// Offline → Free while attached
    Restore,
}

impl Transition {
    pub fn kind(&self) -> TransitionKind {
        match self {
            Transition::Reserve { .. } => TransitionKind::Reserve,
            Transition::Allocate { .. } => TransitionKind::Allocate,
            Transition::Rollback => TransitionKind::Rollback,
            Transition::Expire => TransitionKind::Expire,
            Transition::Release => TransitionKind::Release,
            Transition::Reassign { .. } => TransitionKind::Reassign,
            Transition::Detach => TransitionKind::Detach,
            Transition::Drain => TransitionKind::Drain,
            Transition::Attach => TransitionKind::Attach,
            Transition::Restore => TransitionKind::Restore,
        }
    }
}

/// Transition kind, also used as the usage record event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Reserve,
    Allocate,
    Rollback,
    Expire,
    Release,
    Reassign,
    Detach,
    Drain,
    Attach,
    Restore,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionKind::Reserve => "reserve",
            TransitionKind::Allocate => "allocate",
            TransitionKind::Rollback => "rollback",
            TransitionKind::Expire => "expire",
            TransitionKind::Release => "release",
            TransitionKind::Reassign => "reassign",
            TransitionKind::Detach => "detach",
            TransitionKind::Drain => "drain",
            TransitionKind::Attach => "attach",
            TransitionKind::Restore => "restore",
        };
        f.write_str(s)
    }
}

impl Device {
    /// Apply `transition`, returning the previous allocation.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) -> PoolResult<Allocation> {
        let next = self
            .allocation
            .step(transition)
            .ok_or_else(|| PoolError::InvalidTransition {
                device: self.id.clone(),
                attempted: transition.kind(),
                current: self.status(),
            })?;
        self.updated_at = now;
        Ok(std::mem::replace(&mut self.allocation, next))
    }
}
