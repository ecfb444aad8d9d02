//! Event API Handlers
//!
//! HTTP endpoints for the event queue.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gantry_core::domain::event::Event;
use gantry_core::dto::event::CreateEvent;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::event_service;

/// POST /api/v1/events
/// Enqueue a new pipeline run
pub async fn create_event(
    State(state): State<AppState>,
    Json(req): Json<CreateEvent>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    tracing::info!("Creating event for pipeline: {}", req.pipeline.id);

    let event =
        event_service::create_event(state.events.as_ref(), state.records.as_ref(), req).await?;

    Ok((StatusCode::CREATED, Json(event)))
}

/// GET /api/v1/events/{id}
pub async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Event>> {
    tracing::debug!("Getting event: {}", id);

    let event = event_service::get_event(state.events.as_ref(), id).await?;
    Ok(Json(event))
}

/// POST /api/v1/events/next
/// Claim the oldest eligible event; `204 No Content` when there is none
pub async fn next_event(State(state): State<AppState>) -> ApiResult<Response> {
    let event = event_service::next_event(state.events.as_ref()).await?;

    Ok(match event {
        Some(event) => Json(event).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

/// PUT /api/v1/events/{id}
/// Status push from the worker holding the event
pub async fn update_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(event): Json<Event>,
) -> ApiResult<StatusCode> {
    tracing::debug!("Updating event: {}", id);

    event_service::update_event(
        state.events.as_ref(),
        state.records.as_ref(),
        &state.bus,
        id,
        event,
    )
    .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/events/{id}/lease
pub async fn renew_lease(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    event_service::renew_lease(state.events.as_ref(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/events/{id}/reset
pub async fn reset_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Event>> {
    let event = event_service::reset_event(state.events.as_ref(), id).await?;
    Ok(Json(event))
}

/// DELETE /api/v1/events/{id}
pub async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    event_service::delete_event(state.events.as_ref(), state.records.as_ref(), &state.bus, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
