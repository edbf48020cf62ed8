//! Domain layer: entities and business logic
//!
//! This layer is independent of external concerns (no I/O, no CLI, no config loading).

pub mod arena;
pub mod builder;
pub mod condition;
pub mod context;
pub mod entities;
pub mod error;
pub mod formula;
pub mod path;
pub mod pricing;
pub mod snapshot;

pub use arena::{TreeArena, TreeNode};
pub use builder::{build_tree, flatten, NodeDraft, NodeSpec, NodeTree};
pub use condition::{EvaluationCache, LogicalOp, Operator, RuleNode};
pub use context::ConfigurationContext;
pub use entities::*;
pub use error::{DomainError, DomainResult, ErrorKind};
pub use formula::Formula;
pub use pricing::{PricedConfiguration, PricingAggregator, PricingOptions, VisibilityResolver};
