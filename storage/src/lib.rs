//! Reference implementations of the repository seams declared in
//! `bitmessage-core`: plain in-memory tables, plus sled-backed stores
//! for the inventory and the known-node registry.

pub mod memory;
pub mod sled_store;

pub use memory::{
    MemoryAddressRepository, MemoryInventoryRepository, MemoryMessageRepository,
    MemoryNodeRegistry, MemoryPowRepository,
};
pub use sled_store::{open_database, SledInventoryRepository, SledNodeRegistry};
