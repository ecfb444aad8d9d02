//! Log stream DTOs

use serde::{Deserialize, Serialize};

use crate::domain::record::StageName;

/// Query string of the stage log stream upgrade endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLogQuery {
    pub stage: StageName,
    pub task: Option<String>,
}

/// Frame sent to log viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerFrame {
    pub stage: StageName,
    pub task: Option<String>,
    pub id: String,
    pub log: String,
}
