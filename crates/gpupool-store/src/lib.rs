//! gpupool-store: Transactional entity store
//!
//! This crate provides the storage abstraction the allocation engine runs on:
//! - Versioned entities with compare-and-set writes
//! - Atomic batches covering entity writes and ledger appends
//! - An in-memory store with optional JSON snapshot durability

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use traits::{EntityWrite, RelationWrite, Store, Versioned, WriteBatch};
