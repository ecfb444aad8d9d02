//! Pipeline record domain types
//!
//! A pipeline record is one execution of a pipeline. It is created when a run
//! is requested, mutated only by the worker's stage manager while the run is in
//! flight, and immutable once it reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Status shared by records, stages and tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl Status {
    /// Whether the status can no longer change
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failed | Status::Aborted)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "Pending"),
            Status::Running => write!(f, "Running"),
            Status::Success => write!(f, "Success"),
            Status::Failed => write!(f, "Failed"),
            Status::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Named phases of a pipeline run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageName {
    CodeCheckout,
    Package,
    ImageBuild,
    IntegrationTest,
    ImageRelease,
    #[serde(rename = "createSCMTag")]
    CreateScmTag,
}

impl StageName {
    /// All stages in their fixed execution order
    pub const ORDER: [StageName; 6] = [
        StageName::CodeCheckout,
        StageName::Package,
        StageName::ImageBuild,
        StageName::IntegrationTest,
        StageName::ImageRelease,
        StageName::CreateScmTag,
    ];

    /// Wire name, as used in log stream query strings and log file names
    pub fn as_str(self) -> &'static str {
        match self {
            StageName::CodeCheckout => "codeCheckout",
            StageName::Package => "package",
            StageName::ImageBuild => "imageBuild",
            StageName::IntegrationTest => "integrationTest",
            StageName::ImageRelease => "imageRelease",
            StageName::CreateScmTag => "createSCMTag",
        }
    }

    /// Human readable description used in stage log markers and error messages
    pub fn description(self) -> &'static str {
        match self {
            StageName::CodeCheckout => "Code checkout",
            StageName::Package => "Package",
            StageName::ImageBuild => "Build image",
            StageName::IntegrationTest => "Integration test",
            StageName::ImageRelease => "Push image",
            StageName::CreateScmTag => "Create SCM tag",
        }
    }

    /// Parses a wire name back into a stage
    pub fn parse(s: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|stage| stage.as_str() == s)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status, start and end time of one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralStageStatus {
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// One commit as reported by the SCM after checkout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitLog {
    pub id: String,
    pub author: String,
    pub date: Option<DateTime<Utc>>,
    pub message: String,
}

/// Commits of the main repository and its dependent repositories
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commits {
    pub main_repo: Option<CommitLog>,
    #[serde(default)]
    pub dep_repos: Vec<CommitLog>,
}

/// Code checkout status, which also carries the checked-out commits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeCheckoutStageStatus {
    #[serde(flatten)]
    pub general: GeneralStageStatus,
    #[serde(default)]
    pub commits: Commits,
    pub version: Option<String>,
}

/// Status of one parallel unit of work inside a fan-out stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub name: String,
    /// Image reference produced (built or pushed) by the task
    pub image: Option<String>,
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskStatus {
    /// Creates a pending task entry
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Status of a fan-out stage (image build, image release)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanOutStageStatus {
    #[serde(flatten)]
    pub general: GeneralStageStatus,
    #[serde(default)]
    pub tasks: Vec<TaskStatus>,
}

impl FanOutStageStatus {
    /// Images produced by the tasks that succeeded, in task order
    pub fn succeeded_images(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == Status::Success)
            .filter_map(|t| t.image.clone())
            .collect()
    }
}

/// Per-stage status of a pipeline record
///
/// A stage that was never executed stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub code_checkout: Option<CodeCheckoutStageStatus>,
    pub package: Option<GeneralStageStatus>,
    pub image_build: Option<FanOutStageStatus>,
    pub integration_test: Option<GeneralStageStatus>,
    pub image_release: Option<FanOutStageStatus>,
    #[serde(rename = "createSCMTag")]
    pub create_scm_tag: Option<GeneralStageStatus>,
}

impl StageStatus {
    /// Returns the general status of a stage, if the stage has been touched
    pub fn general(&self, stage: StageName) -> Option<&GeneralStageStatus> {
        match stage {
            StageName::CodeCheckout => self.code_checkout.as_ref().map(|s| &s.general),
            StageName::Package => self.package.as_ref(),
            StageName::ImageBuild => self.image_build.as_ref().map(|s| &s.general),
            StageName::IntegrationTest => self.integration_test.as_ref(),
            StageName::ImageRelease => self.image_release.as_ref().map(|s| &s.general),
            StageName::CreateScmTag => self.create_scm_tag.as_ref(),
        }
    }

    /// Returns the general status of a stage, creating the stage entry if needed
    pub fn general_mut(&mut self, stage: StageName) -> &mut GeneralStageStatus {
        match stage {
            StageName::CodeCheckout => &mut self.code_checkout.get_or_insert_with(Default::default).general,
            StageName::Package => self.package.get_or_insert_with(Default::default),
            StageName::ImageBuild => &mut self.image_build.get_or_insert_with(Default::default).general,
            StageName::IntegrationTest => self.integration_test.get_or_insert_with(Default::default),
            StageName::ImageRelease => &mut self.image_release.get_or_insert_with(Default::default).general,
            StageName::CreateScmTag => self.create_scm_tag.get_or_insert_with(Default::default),
        }
    }

    /// Returns the task list of a fan-out stage
    pub fn tasks_mut(&mut self, stage: StageName) -> Option<&mut Vec<TaskStatus>> {
        match stage {
            StageName::ImageBuild => Some(&mut self.image_build.get_or_insert_with(Default::default).tasks),
            StageName::ImageRelease => {
                Some(&mut self.image_release.get_or_insert_with(Default::default).tasks)
            }
            _ => None,
        }
    }
}

/// Immutable run configuration, fixed when the run is enqueued
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformParams {
    /// Git ref to check out, e.g. `master` or `refs/tags/v1.0`
    #[serde(rename = "ref")]
    pub reference: String,
    /// Stages requested for this run; `Package` always runs regardless
    #[serde(default)]
    pub stages: Vec<StageName>,
    #[serde(default, rename = "createSCMTag")]
    pub create_scm_tag: bool,
    #[serde(default)]
    pub cache_dependency: bool,
    #[serde(default)]
    pub description: String,
}

impl PerformParams {
    /// Requested stages as a set
    pub fn stage_set(&self) -> HashSet<StageName> {
        self.stages.iter().copied().collect()
    }

    /// Whether an optional stage was requested
    pub fn requests(&self, stage: StageName) -> bool {
        match stage {
            StageName::CodeCheckout | StageName::Package => true,
            StageName::CreateScmTag => self.create_scm_tag || self.stages.contains(&stage),
            _ => self.stages.contains(&stage),
        }
    }
}

/// One execution of a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: Uuid,
    /// Version name; filled from the checked-out commit when left empty
    #[serde(default)]
    pub name: String,
    pub pipeline_id: Uuid,
    /// What triggered the run (manual, webhook, cron...)
    #[serde(default)]
    pub trigger: String,
    pub perform_params: PerformParams,
    #[serde(default)]
    pub stage_status: StageStatus,
    pub status: Status,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: String,
}

impl PipelineRecord {
    /// Creates a pending record for a new run
    pub fn new(pipeline_id: Uuid, perform_params: PerformParams, trigger: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            pipeline_id,
            trigger: trigger.into(),
            perform_params,
            stage_status: StageStatus::default(),
            status: Status::Pending,
            start_time: None,
            end_time: None,
            error_message: String::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!Status::Pending.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(Status::Success.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(Status::Aborted.is_terminal());
    }

    #[test]
    fn test_stage_name_wire_format() {
        assert_eq!(
            serde_json::to_string(&StageName::CreateScmTag).unwrap(),
            "\"createSCMTag\""
        );
        assert_eq!(
            serde_json::to_string(&StageName::ImageBuild).unwrap(),
            "\"imageBuild\""
        );
        for stage in StageName::ORDER {
            assert_eq!(StageName::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(StageName::parse("codeScan"), None);
    }

    #[test]
    fn test_package_and_checkout_always_requested() {
        let params = PerformParams {
            reference: "master".to_string(),
            stages: vec![StageName::ImageBuild],
            ..Default::default()
        };

        assert!(params.requests(StageName::CodeCheckout));
        assert!(params.requests(StageName::Package));
        assert!(params.requests(StageName::ImageBuild));
        assert!(!params.requests(StageName::IntegrationTest));
        assert!(!params.requests(StageName::CreateScmTag));
    }

    #[test]
    fn test_scm_tag_requested_by_flag() {
        let params = PerformParams {
            create_scm_tag: true,
            ..Default::default()
        };
        assert!(params.requests(StageName::CreateScmTag));
    }

    #[test]
    fn test_untouched_stages_stay_absent() {
        let mut status = StageStatus::default();
        status.general_mut(StageName::Package).status = Status::Running;

        assert!(status.general(StageName::Package).is_some());
        assert!(status.general(StageName::IntegrationTest).is_none());
        assert!(status.image_release.is_none());
    }

    #[test]
    fn test_succeeded_images() {
        let mut stage = FanOutStageStatus::default();
        stage.tasks = vec![
            TaskStatus {
                name: "a".into(),
                image: Some("a:v1".into()),
                status: Status::Success,
                ..Default::default()
            },
            TaskStatus {
                name: "b".into(),
                image: Some("b:v1".into()),
                status: Status::Failed,
                ..Default::default()
            },
        ];

        assert_eq!(stage.succeeded_images(), vec!["a:v1".to_string()]);
    }

    #[test]
    fn test_perform_params_wire_names() {
        let params: PerformParams = serde_json::from_value(serde_json::json!({
            "ref": "master",
            "stages": ["codeCheckout", "package"],
            "createSCMTag": true
        }))
        .unwrap();

        assert_eq!(params.reference, "master");
        assert_eq!(params.stages, vec![StageName::CodeCheckout, StageName::Package]);
        assert!(params.create_scm_tag);
        assert!(!params.cache_dependency);
    }
}
