//! Pipeline and project snapshot types
//!
//! Projects and pipelines are managed elsewhere; an event carries a snapshot
//! of both so a worker can run without further lookups.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Container registry a project pushes to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    pub server: String,
    pub repository: String,
    pub username: String,
    pub password: String,
}

/// SCM access for a project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScmConfig {
    /// Token used for clone and tag push, empty for public repositories
    #[serde(default)]
    pub token: String,
}

/// Project snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub scm: ScmConfig,
    pub registry: Option<Registry>,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            scm: ScmConfig::default(),
            registry: None,
        }
    }
}

/// Build tool, used to pick a dependency cache directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTool {
    Maven,
    Npm,
    Gradle,
}

impl BuildTool {
    /// Cache directory inside the builder container
    pub fn cache_dir(self) -> &'static str {
        match self {
            BuildTool::Maven => "/root/.m2",
            BuildTool::Npm => "/root/.npm",
            BuildTool::Gradle => "/root/.gradle",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildTool::Maven => "maven",
            BuildTool::Npm => "npm",
            BuildTool::Gradle => "gradle",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderImage {
    pub image: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub build_tool: Option<BuildTool>,
    #[serde(default)]
    pub cache_dependency: bool,
}

/// A repository to check out
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeSource {
    pub url: String,
    /// Ref to check out; dependent repositories fall back to their default branch
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DepRepo {
    #[serde(flatten)]
    pub source: CodeSource,
    /// Folder under the workspace the repository is cloned into
    pub folder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeCheckoutStage {
    pub main_repo: CodeSource,
    #[serde(default)]
    pub dep_repos: Vec<DepRepo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitTestStage {
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageStage {
    #[serde(default)]
    pub command: Vec<String>,
    /// Paths inside the builder container to copy back into the workspace
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// One image to build
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageBuildInfo {
    #[serde(default)]
    pub task_name: String,
    /// Build context, relative to the workspace
    #[serde(default)]
    pub context_dir: String,
    /// Dockerfile path, relative to the workspace
    #[serde(default)]
    pub dockerfile_path: String,
    /// Inline Dockerfile content; wins over `dockerfile_path`
    #[serde(default)]
    pub dockerfile: String,
    pub image_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageBuildStage {
    #[serde(default)]
    pub build_infos: Vec<ImageBuildInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationTestConfig {
    /// Substring of a built image name selecting the image under test
    pub image_name: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// A dependent service started alongside the integration test container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationService {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationTestStage {
    pub config: IntegrationTestConfig,
    #[serde(default)]
    pub services: Vec<IntegrationService>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleasePolicy {
    pub image_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageReleaseStage {
    #[serde(default)]
    pub release_policies: Vec<ReleasePolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildStages {
    pub code_checkout: Option<CodeCheckoutStage>,
    pub unit_test: Option<UnitTestStage>,
    pub package: Option<PackageStage>,
    pub image_build: Option<ImageBuildStage>,
    pub integration_test: Option<IntegrationTestStage>,
    pub image_release: Option<ImageReleaseStage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub builder_image: Option<BuilderImage>,
    pub build_info: Option<BuildInfo>,
    #[serde(default)]
    pub stages: BuildStages,
}

/// Pipeline snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub project_id: Uuid,
    #[serde(default)]
    pub build: BuildSpec,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            project_id: Uuid::nil(),
            build: BuildSpec::default(),
        }
    }
}
