//! CLI command implementations.

pub mod consolidate;
pub mod inspect;
pub mod run;
pub mod store;
