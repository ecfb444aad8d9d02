//! Record API Handlers

use axum::{
    Json,
    extract::{Path, State},
};
use gantry_core::domain::record::PipelineRecord;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::event_service;

/// GET /api/v1/projects/{project_id}/pipelines/{pipeline_id}/records/{record_id}
pub async fn get_record(
    State(state): State<AppState>,
    Path((project_id, pipeline_id, record_id)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<Json<PipelineRecord>> {
    tracing::debug!("Getting record {} of pipeline {}", record_id, pipeline_id);

    let record = event_service::get_record(state.records.as_ref(), project_id, pipeline_id, record_id).await?;
    Ok(Json(record))
}
