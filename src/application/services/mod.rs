//! Application services
//!
//! Concrete service implementations that orchestrate domain logic.
//! Services depend on storage traits (NodeRepository, Catalog, ...) but are
//! themselves concrete structs, not traits.

mod configuration;
mod hierarchy;

pub use configuration::ConfigurationService;
pub use hierarchy::HierarchyService;
