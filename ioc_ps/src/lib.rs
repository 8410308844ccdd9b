//! Power-supply soft IOC.
//!
//! Bridges BSMP power-supply controllers on an RS-485 bus to a set of
//! process variables. The PV-server driver calls
//! [`App::read`](app::App::read) / [`App::write`](app::App::write) /
//! [`App::process`](app::App::process); the application polls devices,
//! publishes low-level PVs and derives the diagnostic PVs through the
//! computed-PV engine.
//!
//! # Module Structure
//!
//! - [`app`] - Driver-facing application surface and device wiring
//! - [`controller`] - BSMP device controller with bounded retry
//! - [`db`] - Per-device PV database
//! - [`sim`] - Simulated BSMP slave bus for development and tests
//! - [`vars`] - Device variable/function numbering and payload codecs

pub mod app;
pub mod controller;
pub mod db;
pub mod sim;
pub mod vars;

pub use app::App;
pub use controller::PsController;
pub use sim::SimBus;
