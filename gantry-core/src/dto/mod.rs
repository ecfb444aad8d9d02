//! Data Transfer Objects for inter-service communication
//!
//! DTOs exchanged between the controller, workers and log viewers.

pub mod event;
pub mod log;
