//! Error types for gpupool

use thiserror::Error;

use crate::allocation::{DeviceStatus, TransitionKind};
use crate::inventory::{ConsumerId, DeviceId};

/// Kind of entity named by a lookup failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Cluster,
    Node,
    Device,
    Relation,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Cluster => write!(f, "cluster"),
            EntityKind::Node => write!(f, "node"),
            EntityKind::Device => write!(f, "device"),
            EntityKind::Relation => write!(f, "usage relation"),
        }
    }
}

/// Main error type for gpupool
#[derive(Error, Debug)]
pub enum PoolError {
    /// Unknown cluster, node, device or relation
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// Membership or state conflict
    #[error("Conflict on {entity} (state: {state}): {reason}")]
    Conflict {
        entity: String,
        state: String,
        reason: String,
    },

    /// Not enough free devices match the selector
    #[error(
        "Insufficient resources: requested {requested} device(s) matching {selector}, {available} available"
    )]
    InsufficientResources {
        requested: usize,
        available: usize,
        selector: String,
    },

    /// Illegal state change; signals a logic or integrity fault
    #[error("Invalid transition on device {device}: cannot {attempted} while {current}")]
    InvalidTransition {
        device: DeviceId,
        attempted: TransitionKind,
        current: DeviceStatus,
    },

    /// Release or reassign attempted by a consumer that does not hold the device
    #[error("Permission denied on device {device} for {consumer}: held by {}", holder_display(.holder))]
    PermissionDenied {
        device: DeviceId,
        consumer: ConsumerId,
        holder: Option<ConsumerId>,
    },

    /// Store backend or data-integrity error
    #[error("Store error: {0}")]
    Store(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

fn holder_display(holder: &Option<ConsumerId>) -> String {
    match holder {
        Some(h) => h.to_string(),
        None => "nobody".to_string(),
    }
}

impl PoolError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        PoolError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: impl ToString, state: impl ToString, reason: impl Into<String>) -> Self {
        PoolError::Conflict {
            entity: entity.to_string(),
            state: state.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry, possibly with a wider selector.
    ///
    /// Invalid transitions and integrity violations are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Conflict { .. } | PoolError::InsufficientResources { .. }
        )
    }
}

/// Result type for gpupool operations
pub type PoolResult<T> = Result<T, PoolError>;

impl From<serde_json::Error> for PoolError {
    fn from(err: serde_json::Error) -> Self {
        PoolError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PoolError {
    fn from(err: toml::de::Error) -> Self {
        PoolError::Config(err.to_string())
    }
}
