//! Stage helpers
//!
//! Pure functions shared by the stages: log markers, naming, image
//! reference handling and workspace path resolution.

use anyhow::Result;
use chrono::{DateTime, Utc};
use gantry_core::domain::pipeline::{BuildInfo, ImageBuildInfo};
use gantry_core::domain::record::{PerformParams, StageName};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

/// Directory under the workspace holding files generated by the worker
const GENERATED_DIR: &str = ".gantry";

// =============================================================================
// Log markers
// =============================================================================

pub fn start_marker(stage: StageName) -> String {
    format!("Stage: {} status: start", stage.description())
}

pub fn finish_marker(stage: StageName, outcome: &Result<()>) -> String {
    match outcome {
        Ok(()) => format!("Stage: {} status: finish", stage.description()),
        Err(e) => format!("Stage: {} status: fail with error: {:#}", stage.description(), e),
    }
}

// =============================================================================
// Naming
// =============================================================================

/// Version name of a run: short commit id and run start time
pub fn version_name(commit_id: &str, started: DateTime<Utc>) -> String {
    let short: String = commit_id.chars().take(7).collect();
    format!("{}-{}", short, started.format("%y%m%d%H%M%S"))
}

/// Task names of a fan-out stage
///
/// Names end up in log file names and generated Dockerfile names, so anything
/// outside `[A-Za-z0-9._-]` is replaced and repeated names get a `-{n}`
/// suffix. Unnamed tasks get a positional name.
pub fn task_names<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut used = HashSet::new();
    names
        .enumerate()
        .map(|(i, name)| {
            let name: String = name
                .trim()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '-' })
                .collect();
            let name = if name.is_empty() { format!("task-{}", i + 1) } else { name };

            let mut unique = name.clone();
            let mut n = 2;
            while !used.insert(unique.clone()) {
                unique = format!("{}-{}", name, n);
                n += 1;
            }
            unique
        })
        .collect()
}

// =============================================================================
// Image references
// =============================================================================

/// Whether an image reference carries a tag or digest
///
/// Only a colon in the last path segment is a tag; `registry:5000/app` has none.
fn has_tag(image: &str) -> bool {
    if image.contains('@') {
        return true;
    }
    image.rsplit('/').next().is_some_and(|last| last.contains(':'))
}

/// Ensures an image reference is tagged, defaulting the tag to `tag`
pub fn format_image_name(image: &str, tag: &str) -> String {
    let image = image.trim();
    if has_tag(image) {
        image.to_string()
    } else {
        format!("{}:{}", image, tag)
    }
}

/// Repository name of an image without registry, namespace, tag or digest
fn image_base_name(image: &str) -> String {
    let image = image.trim();
    let image = image.split('@').next().unwrap_or(image);
    let last = image.rsplit('/').next().unwrap_or(image);
    let last = last.split(':').next().unwrap_or(last);
    last.to_lowercase()
}

/// Finds the built image a release policy refers to
///
/// Both sides are reduced to their repository name and compared without case.
pub fn match_release_image<'a>(built_images: &'a [String], policy_image: &str) -> Option<&'a String> {
    let wanted = image_base_name(policy_image);
    if wanted.is_empty() {
        return None;
    }
    built_images
        .iter()
        .find(|image| image_base_name(image) == wanted)
}

/// First built image whose reference contains the configured test image name
pub fn find_test_image<'a>(built_images: &'a [String], image_name: &str) -> Option<&'a String> {
    let image_name = image_name.trim();
    if image_name.is_empty() {
        return None;
    }
    built_images.iter().find(|image| image.contains(image_name))
}

// =============================================================================
// Workspace paths
// =============================================================================

/// Joins a relative path under `base`, rejecting absolute paths and `..`
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf> {
    let relative = relative.trim().trim_start_matches("./");
    let path = Path::new(relative);

    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("path '{}' must stay inside the workspace", relative),
        }
    }

    Ok(base.join(path))
}

/// Where a declared package output ends up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLocation {
    /// Inside the bind-mounted workspace, already visible on the host
    Workspace(PathBuf),
    /// Elsewhere in the builder container, must be copied out
    Container(String),
}

pub fn resolve_output(workspace: &Path, output: &str) -> Result<OutputLocation> {
    let output = output.trim();
    if output.is_empty() {
        anyhow::bail!("empty output path");
    }

    if output.starts_with('/') {
        let path = Path::new(output);
        if path.starts_with(workspace) {
            return Ok(OutputLocation::Workspace(path.to_path_buf()));
        }
        return Ok(OutputLocation::Container(output.to_string()));
    }

    Ok(OutputLocation::Workspace(safe_join(workspace, output)?))
}

/// Dependency cache bind mount for the builder container
///
/// Only mounted when both the run and the pipeline ask for it.
pub fn cache_bind(build_info: Option<&BuildInfo>, params: &PerformParams) -> Option<String> {
    let build_info = build_info?;
    if !params.cache_dependency || !build_info.cache_dependency {
        return None;
    }
    let dir = build_info.build_tool?.cache_dir();
    Some(format!("{}:{}", dir, dir))
}

/// Where the Dockerfile of an image build comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerfileSource {
    /// Inline content, to be written to `path` before the build
    Inline { path: PathBuf, content: String },
    File(PathBuf),
}

impl DockerfileSource {
    pub fn path(&self) -> &Path {
        match self {
            DockerfileSource::Inline { path, .. } => path,
            DockerfileSource::File(path) => path,
        }
    }
}

/// Resolves the build context and Dockerfile of one build task
///
/// Inline content wins over a Dockerfile path, which wins over `Dockerfile`
/// at the root of the context. Inline content is written per task so
/// concurrent builds never share a file.
pub fn resolve_build(workspace: &Path, info: &ImageBuildInfo, task: &str) -> Result<(PathBuf, DockerfileSource)> {
    let context_dir = safe_join(workspace, &info.context_dir)?;

    let source = if !info.dockerfile.trim().is_empty() {
        DockerfileSource::Inline {
            path: workspace
                .join(GENERATED_DIR)
                .join("dockerfiles")
                .join(format!("{}.Dockerfile", task)),
            content: info.dockerfile.clone(),
        }
    } else if !info.dockerfile_path.trim().is_empty() {
        DockerfileSource::File(safe_join(workspace, &info.dockerfile_path)?)
    } else {
        DockerfileSource::File(context_dir.join("Dockerfile"))
    };

    Ok((context_dir, source))
}
