//! Attribute hierarchies and dynamic pricing for configurable products.
//!
//! Layers, innermost first: [`domain`] (trees, rules, formulas, pricing),
//! [`application`] (services), [`infrastructure`] (stores, wiring) and
//! [`cli`].

pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod exitcode;
pub mod infrastructure;
pub mod util;
