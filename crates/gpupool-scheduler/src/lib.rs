//! gpupool-scheduler: Exclusive GPU allocation for gpupool
//!
//! This crate provides the services built on a [`gpupool_store::Store`]:
//! - Inventory administration (clusters, nodes, device membership)
//! - The usage ledger (audit records and device/consumer relations)
//! - The allocation engine and its stale-reservation sweeper

pub mod engine;
pub mod inventory;
pub mod ledger;
pub mod locks;
pub mod paging;
pub mod placement;
pub mod sweeper;

pub use engine::{AllocationEngine, AllocationFilter, AllocationView};
pub use inventory::Inventory;
pub use ledger::UsageLedger;
pub use locks::DeviceLocks;
pub use paging::PoolStream;
pub use placement::{Candidate, DefaultPlacementStrategy, PlacementDecision, PlacementStrategy};
pub use sweeper::{ReservationSweeper, SweeperHandle};
