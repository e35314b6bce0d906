//! Store error types

use gpupool_core::{DeviceId, EntityKind, PoolError};
use thiserror::Error;

/// Errors raised by a [`Store`](crate::Store) backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// Compare-and-set precondition failed
    #[error("Version conflict on {entity}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        entity: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    /// Close or commit of a relation that is not open
    #[error("No open usage relation for device {0}")]
    NoOpenRelation(DeviceId),

    /// A device may have only one open relation
    #[error("Device {0} already has an open usage relation")]
    RelationAlreadyOpen(DeviceId),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for PoolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::VersionConflict {
                entity, found, ..
            } => PoolError::conflict(
                entity,
                match found {
                    Some(v) => format!("version {}", v),
                    None => "absent".to_string(),
                },
                "concurrent modification",
            ),
            StoreError::NoOpenRelation(device) => PoolError::not_found(EntityKind::Relation, device),
            StoreError::RelationAlreadyOpen(device) => PoolError::conflict(
                format!("device {}", device),
                "relation open",
                "device already has an open usage relation",
            ),
            StoreError::Io(e) => PoolError::Io(e),
            StoreError::Serialization(e) => PoolError::Serialization(e.to_string()),
        }
    }
}
