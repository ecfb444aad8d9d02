//! API Module
//!
//! HTTP and WebSocket API layer for the controller.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod event;
pub mod health;
pub mod log_stream;
pub mod record;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::repository::{EventStore, RecordStore};
use crate::service::LogBus;

/// Shared state of all handlers
#[derive(Clone)]
pub struct AppState {
    pub events: Arc<dyn EventStore>,
    pub records: Arc<dyn RecordStore>,
    pub bus: LogBus,
}

impl AppState {
    pub fn new(events: Arc<dyn EventStore>, records: Arc<dyn RecordStore>) -> Self {
        Self {
            events,
            records,
            bus: LogBus::new(),
        }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Event endpoints
        .route("/api/v1/events", post(event::create_event))
        .route("/api/v1/events/next", post(event::next_event))
        .route(
            "/api/v1/events/{id}",
            get(event::get_event)
                .put(event::update_event)
                .delete(event::delete_event),
        )
        .route("/api/v1/events/{id}/lease", post(event::renew_lease))
        .route("/api/v1/events/{id}/reset", post(event::reset_event))
        // Record endpoints
        .route(
            "/api/v1/projects/{project_id}/pipelines/{pipeline_id}/records/{record_id}",
            get(record::get_record),
        )
        .route(
            "/api/v1/projects/{project_id}/pipelines/{pipeline_id}/records/{record_id}/stagelogstream",
            get(log_stream::stage_log_stream),
        )
        .route(
            "/api/v1/projects/{project_id}/pipelines/{pipeline_id}/records/{record_id}/logstream",
            get(log_stream::viewer_log_stream),
        )
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
