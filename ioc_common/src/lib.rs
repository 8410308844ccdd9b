//! IOC Common Library
//!
//! Shared data model and configuration loading for the IOC workspace
//! crates.
//!
//! # Module Structure
//!
//! - [`pv`] - Typed process-variable descriptors, values, alarm limits
//! - [`db`] - Ordered PV database with build-time validation
//! - [`csdev`] - Control-system device enums: power state, operating
//!   mode translation tables, interlock words
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience

pub mod config;
pub mod csdev;
pub mod db;
pub mod prelude;
pub mod pv;
