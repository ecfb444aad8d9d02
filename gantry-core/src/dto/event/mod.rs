//! Event DTOs

use serde::{Deserialize, Serialize};

use crate::domain::pipeline::{Pipeline, Project};
use crate::domain::record::PerformParams;

/// Request to enqueue a new pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEvent {
    pub project: Project,
    pub pipeline: Pipeline,
    pub perform_params: PerformParams,
    /// Version name of the run; derived from the checked-out commit when absent
    pub name: Option<String>,
    pub trigger: Option<String>,
}
