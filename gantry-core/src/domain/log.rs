//! Log stream domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::StageName;

/// Operation name for stage logs on the log bus
pub const STAGE_LOG_OPERATION: &str = "stagelog";

/// Prefix marking container image push/pull progress lines
pub const IMAGE_LAYER_MARKER: &str = "layer ";

/// Identifies one log stream: a run, and within it a stage and optional task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogStreamKey {
    pub operation: String,
    pub owner: String,
    pub pipeline: String,
    pub run: String,
    pub stage: StageName,
    pub task: Option<String>,
}

impl LogStreamKey {
    pub fn stage_log(owner: impl Into<String>, pipeline: impl Into<String>, run: impl Into<String>, stage: StageName) -> Self {
        Self {
            operation: STAGE_LOG_OPERATION.to_string(),
            owner: owner.into(),
            pipeline: pipeline.into(),
            run: run.into(),
            stage,
            task: None,
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    /// Bus topic of the run this stream belongs to
    pub fn topic(&self) -> String {
        topic_name(&self.operation, &self.owner, &self.pipeline, &self.run)
    }

    /// File name of the local log buffer, `{stage}` or `{stage}-{task}`
    pub fn file_name(&self) -> String {
        match &self.task {
            Some(task) => format!("{}-{}.log", self.stage, task),
            None => format!("{}.log", self.stage),
        }
    }
}

/// Builds a bus topic name: `{operation}__{owner}__{pipeline}__{run}`
///
/// Dashes are replaced with underscores so uuids make valid topic names.
pub fn topic_name(operation: &str, owner: &str, pipeline: &str, run: &str) -> String {
    [operation, owner, pipeline, run]
        .iter()
        .map(|part| part.replace('-', "_"))
        .collect::<Vec<_>>()
        .join("__")
}

/// A log line as handed to viewers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerLine {
    /// Frame id; image progress lines of the same layer share one
    pub id: String,
    pub log: String,
}

/// Classifies one raw bus line for viewers
///
/// Image progress lines (`layer <id>: <progress>`) lose the marker and take
/// the layer id as frame id. Every other line gets a fresh id. Empty lines
/// and bare carriage returns are dropped.
pub fn viewer_line(raw: &str) -> Option<ViewerLine> {
    if raw.is_empty() || raw == "\r" {
        return None;
    }

    if let Some(rest) = raw.strip_prefix(IMAGE_LAYER_MARKER) {
        let head = rest.split(':').next().unwrap_or_default();
        let layer = head.split(' ').next().unwrap_or_default();
        if !layer.is_empty() {
            return Some(ViewerLine {
                id: layer.to_string(),
                log: rest.to_string(),
            });
        }
    }

    Some(ViewerLine {
        id: Uuid::new_v4().to_string(),
        log: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name_replaces_dashes() {
        let topic = topic_name("stagelog", "team-a", "6f1c-3c7e", "9d4c-1b2a");
        assert_eq!(topic, "stagelog__team_a__6f1c_3c7e__9d4c_1b2a");
    }

    #[test]
    fn test_stream_key_topic_ignores_stage_and_task() {
        let build = LogStreamKey::stage_log("o", "p", "r", StageName::ImageBuild).with_task("api");
        let package = LogStreamKey::stage_log("o", "p", "r", StageName::Package);

        assert_eq!(build.topic(), package.topic());
        assert_eq!(build.file_name(), "imageBuild-api.log");
        assert_eq!(package.file_name(), "package.log");
    }

    #[test]
    fn test_viewer_line_image_layer() {
        let line = viewer_line("layer 3f4a1b: Pushing [=====>   ] 12MB/40MB").unwrap();
        assert_eq!(line.id, "3f4a1b");
        assert_eq!(line.log, "3f4a1b: Pushing [=====>   ] 12MB/40MB");
    }

    #[test]
    fn test_viewer_line_plain() {
        let first = viewer_line("Stage: Package status: start").unwrap();
        let second = viewer_line("Stage: Package status: start").unwrap();
        assert_eq!(first.log, "Stage: Package status: start");
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_viewer_line_drops_empty() {
        assert!(viewer_line("").is_none());
        assert!(viewer_line("\r").is_none());
    }
}
