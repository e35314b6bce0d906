//! gpupool-core: Core types for the gpupool allocation engine
//!
//! This crate provides the fundamental types used throughout gpupool:
//! - Cluster, node and device inventory
//! - The per-device allocation state machine
//! - Usage ledger records and relations
//! - Configuration types
//! - Error handling

pub mod allocation;
pub mod clock;
pub mod config;
pub mod error;
pub mod inventory;
pub mod usage;

pub use allocation::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use inventory::*;
pub use usage::*;
