//! Infrastructure layer: storage implementations and DI container
//!
//! This layer implements the storage traits and wires up services.

pub mod di;
pub mod error;
pub mod json_store;
pub mod memory_store;
pub mod traits;

pub use error::{InfraError, InfraResult};
pub use json_store::JsonFileStore;
pub use memory_store::{MemoryStore, StoreImage};
