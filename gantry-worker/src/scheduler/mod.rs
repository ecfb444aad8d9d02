//! Scheduler layer for the worker
//!
//! In poll mode the worker asks the controller for the next eligible event
//! whenever it has a free run slot, and runs each claimed event in its own
//! task.

pub mod poller;

pub use poller::EventPoller;
