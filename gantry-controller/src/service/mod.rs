//! Service Module
//!
//! Business logic layer for the controller.
//! Services orchestrate between repositories and the log bus.

pub mod event;
pub mod log_bus;

// Re-export for convenience
pub use event as event_service;
pub use log_bus::{BusMessage, LogBus};
