//! Container runtime capability
//!
//! The stage manager only talks to containers through the `ContainerRuntime`
//! trait. Output of runtime operations goes into the stage's log buffer.

mod podman;

pub use podman::PodmanRuntime;

use anyhow::Result;
use async_trait::async_trait;
use gantry_core::domain::pipeline::Registry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::logpipe::LogWriter;

/// Credentials for a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    /// Credentials of a registry, `None` when it has no username
    pub fn from_registry(registry: &Registry) -> Option<Self> {
        if registry.username.is_empty() {
            return None;
        }

        Some(Self {
            server: registry.server.clone(),
            username: registry.username.clone(),
            password: registry.password.clone(),
        })
    }
}

/// What the main process of a container is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerCommand {
    /// Idle shell, commands are run with `exec`
    KeepAlive,
    /// The image's own entrypoint and command
    ImageDefault,
    /// Replaces the image entrypoint
    Entrypoint(Vec<String>),
}

/// Container to start in the background
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: ContainerCommand,
    pub env: BTreeMap<String, String>,
    /// `host:container` bind mounts
    pub binds: Vec<String>,
    pub working_dir: Option<String>,
    pub network: Option<String>,
    /// Host name other containers of the network reach this one by
    pub network_alias: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: ContainerCommand::KeepAlive,
            env: BTreeMap::new(),
            binds: Vec::new(),
            working_dir: None,
            network: None,
            network_alias: None,
        }
    }
}

/// Image build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub context_dir: PathBuf,
    pub dockerfile: PathBuf,
    /// Fully tagged image reference
    pub image: String,
}

/// Container operations used by the stages
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fails when the runtime cannot be used on this host
    async fn check_available(&self) -> Result<()>;

    /// Pulls an image, reporting layer progress to the log
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()>;

    /// Starts a container in the background, pulling its image when missing
    ///
    /// # Returns
    /// Name of the started container
    async fn start_container(
        &self,
        spec: &ContainerSpec,
        auth: Option<&RegistryAuth>,
        log: &LogWriter,
    ) -> Result<String>;

    /// Runs a shell command in a started container
    ///
    /// # Returns
    /// Exit code of the command
    async fn exec(&self, container: &str, command: &str, working_dir: Option<&str>, log: &LogWriter) -> Result<i32>;

    /// Copies a path out of a container into a host directory
    async fn copy_from_container(
        &self,
        container: &str,
        container_path: &str,
        host_dir: &Path,
        log: &LogWriter,
    ) -> Result<()>;

    /// Builds and tags an image
    async fn build_image(&self, options: &BuildOptions, auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()>;

    /// Pushes an image, reporting layer progress to the log
    async fn push_image(&self, image: &str, auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()>;

    /// Stops and removes a container
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Creates a network containers can join and resolve each other on
    async fn create_network(&self, name: &str) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;
}

/// Containers and networks started for one stage
///
/// `release` must be awaited on every exit path of the stage; removal
/// failures are logged and never escalated.
#[derive(Debug, Default)]
pub struct ContainerGuard {
    containers: Vec<String>,
    networks: Vec<String>,
}

impl ContainerGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_container(&mut self, name: impl Into<String>) {
        self.containers.push(name.into());
    }

    pub fn track_network(&mut self, name: impl Into<String>) {
        self.networks.push(name.into());
    }

    /// Removes everything, most recent first
    pub async fn release(self, runtime: &dyn ContainerRuntime) {
        for name in self.containers.iter().rev() {
            match runtime.remove_container(name).await {
                Ok(()) => debug!("Container {} removed", name),
                Err(e) => warn!("Failed to remove container {}: {:#}", name, e),
            }
        }

        for name in self.networks.iter().rev() {
            if let Err(e) = runtime.remove_network(name).await {
                warn!("Failed to remove network {}: {:#}", name, e);
            }
        }
    }
}

/// Rewrites a registry progress line into the `layer <id>: ...` form
///
/// Lines that are not about a specific blob are returned unchanged.
pub fn mark_layer_progress(line: &str) -> String {
    const BLOB_PREFIXES: [&str; 2] = ["Copying blob ", "Copying config "];

    for prefix in BLOB_PREFIXES {
        let Some(rest) = line.strip_prefix(prefix) else {
            continue;
        };
        let digest = rest.split_whitespace().next().unwrap_or_default();
        let digest = digest.strip_prefix("sha256:").unwrap_or(digest);
        let layer: String = digest.chars().take(12).collect();
        if !layer.is_empty() {
            return format!("layer {}: {}", layer, line);
        }
    }

    line.to_string()
}
