//! Core domain types
//!
//! This module contains the core domain structures used across Gantry services.
//! These types are shared between the controller (which queues and persists
//! them) and the worker (which executes pipeline runs and mutates status).

pub mod event;
pub mod log;
pub mod pipeline;
pub mod record;
