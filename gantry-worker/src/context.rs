//! Run context
//!
//! Contains all state of one pipeline run:
//! - The event being executed, whose record the stages mutate
//! - The checkout workspace shared by every stage of the run
//! - Images produced by the image build stage
//!
//! The context is owned by the stage manager for the duration of the run and
//! passed explicitly to each stage.

use chrono::Utc;
use gantry_core::domain::event::Event;
use gantry_core::domain::log::LogStreamKey;
use gantry_core::domain::record::{PipelineRecord, StageName, Status};
use std::path::{Path, PathBuf};

/// Mutable state of a run
pub struct RunContext {
    pub event: Event,
    workspace: PathBuf,
    /// Images built successfully, in build order
    pub built_images: Vec<String>,
}

impl RunContext {
    /// Creates a context for `event`
    ///
    /// # Arguments
    /// * `event` - The claimed event
    /// * `workspace_base` - Base directory for workspaces, one sub-directory per record
    pub fn new(event: Event, workspace_base: &Path) -> Self {
        let workspace = workspace_base.join(event.record.id.to_string());
        Self {
            event,
            workspace,
            built_images: Vec::new(),
        }
    }

    pub fn record(&self) -> &PipelineRecord {
        &self.event.record
    }

    pub fn record_mut(&mut self) -> &mut PipelineRecord {
        &mut self.event.record
    }

    /// Root of the checkout, where the main repository lives
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Short run id used in container and network names
    pub fn run_slug(&self) -> String {
        self.event.record.id.simple().to_string()[..12].to_string()
    }

    /// Log stream key of a stage of this run
    pub fn stream_key(&self, stage: StageName) -> LogStreamKey {
        LogStreamKey::stage_log(
            self.event.project.id.to_string(),
            self.event.pipeline.id.to_string(),
            self.event.record.id.to_string(),
            stage,
        )
    }

    /// Marks a stage running
    pub fn start_stage(&mut self, stage: StageName) {
        let status = self.event.record.stage_status.general_mut(stage);
        status.status = Status::Running;
        status.start_time = Some(Utc::now());
        status.end_time = None;
    }

    /// Records the outcome of a stage
    ///
    /// A failure of any stage but `CreateScmTag` fails the run and sets the
    /// record's error message.
    pub fn finish_stage(&mut self, stage: StageName, outcome: &anyhow::Result<()>) {
        let status = self.event.record.stage_status.general_mut(stage);
        status.end_time = Some(Utc::now());

        match outcome {
            Ok(()) => status.status = Status::Success,
            Err(e) => {
                status.status = Status::Failed;
                if stage != StageName::CreateScmTag {
                    let record = &mut self.event.record;
                    record.status = Status::Failed;
                    record.error_message = format!("{} fails: {:#}", stage.description(), e);
                }
            }
        }
    }
}
