//! Gantry Core
//!
//! Core types and abstractions for the Gantry CI/CD pipeline engine.
//!
//! This crate contains:
//! - Domain types: Events, pipeline records, stage status, pipeline snapshots
//! - DTOs: Data transfer objects for controller/worker communication

pub mod domain;
pub mod dto;
