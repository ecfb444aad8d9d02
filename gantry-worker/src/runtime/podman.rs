//! Podman container runtime
//!
//! Drives the `podman` CLI:
//! - Checking podman availability
//! - Pulling, building and pushing images with optional registry credentials
//! - Starting background containers and executing commands in them
//! - Copying outputs out of containers
//! - Removing containers and networks after a stage

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use super::{BuildOptions, ContainerCommand, ContainerRuntime, ContainerSpec, RegistryAuth, mark_layer_progress};
use crate::logpipe::LogWriter;

/// Container runtime backed by the podman CLI
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl PodmanRuntime {
    pub fn new() -> Self {
        Self {
            binary: "podman".to_string(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true);
        command
    }

    /// Runs a podman command with stdout/stderr going straight into the log
    async fn run_logged(&self, args: &[String], log: &LogWriter, what: &str) -> Result<()> {
        debug!("podman {}", redact(args).join(" "));

        let status = self
            .command()
            .args(args)
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .status()
            .await
            .with_context(|| format!("Failed to execute podman for {}", what))?;

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            error!("{} failed: exit_code={}", what, exit_code);
            anyhow::bail!("{} failed with exit code {}", what, exit_code);
        }

        Ok(())
    }

    /// Runs a podman command whose output carries registry progress
    async fn run_with_progress(&self, args: &[String], log: &LogWriter, what: &str) -> Result<()> {
        debug!("podman {}", redact(args).join(" "));

        let mut child = self
            .command()
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute podman for {}", what))?;

        let stdout = child.stdout.take().context("podman stdout not captured")?;
        let stderr = child.stderr.take().context("podman stderr not captured")?;

        tokio::join!(copy_progress(stdout, log), copy_progress(stderr, log));

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for podman {}", what))?;

        if !status.success() {
            let exit_code = status.code().unwrap_or(-1);
            error!("{} failed: exit_code={}", what, exit_code);
            anyhow::bail!("{} failed with exit code {}", what, exit_code);
        }

        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let status = self
            .command()
            .args(["image", "exists", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("Failed to execute 'podman image exists'")?;

        Ok(status.success())
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn check_available(&self) -> Result<()> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .await
            .context("Failed to execute 'podman --version'. Is podman installed?")?;

        if !output.status.success() {
            anyhow::bail!("Podman is not working correctly");
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!("Podman is available: {}", version.trim());

        Ok(())
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()> {
        let mut args = vec!["pull".to_string()];
        push_creds(&mut args, auth);
        args.push(image.to_string());

        self.run_with_progress(&args, log, &format!("Pull of image {}", image))
            .await
    }

    async fn start_container(
        &self,
        spec: &ContainerSpec,
        auth: Option<&RegistryAuth>,
        log: &LogWriter,
    ) -> Result<String> {
        if !self.image_exists(&spec.image).await? {
            self.pull_image(&spec.image, auth, log).await?;
        }

        info!("Creating container {} for image {}", spec.name, spec.image);

        let args = run_args(spec)?;
        let output = self
            .command()
            .args(&args)
            .output()
            .await
            .context("Failed to execute podman run command")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stdout.trim().is_empty() {
            debug!("podman run stdout: {}", stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("podman run stderr: {}", stderr.trim());
            log.line(stderr.trim());
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);

            let error_msg = format!(
                "Failed to start container for image {}: exit_code={}, stderr='{}'",
                spec.image,
                exit_code,
                stderr.trim()
            );

            error!("{}", error_msg);
            anyhow::bail!("{}", error_msg);
        }

        info!("Container {} started with ID: {}", spec.name, stdout.trim());

        Ok(spec.name.clone())
    }

    async fn exec(&self, container: &str, command: &str, working_dir: Option<&str>, log: &LogWriter) -> Result<i32> {
        debug!("Executing in container {}: {}", container, command);

        let mut cmd = self.command();
        cmd.arg("exec");
        if let Some(dir) = working_dir {
            cmd.arg("-w").arg(dir);
        }

        let status = cmd
            .arg(container)
            .args(["sh", "-c", command])
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .status()
            .await
            .context("Failed to execute podman exec command")?;

        let exit_code = status.code().unwrap_or(1);
        debug!("Command in container {} exited with {}", container, exit_code);

        Ok(exit_code)
    }

    async fn copy_from_container(
        &self,
        container: &str,
        container_path: &str,
        host_dir: &Path,
        log: &LogWriter,
    ) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", container, container_path),
            host_dir.to_string_lossy().to_string(),
        ];

        self.run_logged(&args, log, &format!("Copy of {} out of {}", container_path, container))
            .await
    }

    async fn build_image(&self, options: &BuildOptions, auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()> {
        let mut args = vec![
            "build".to_string(),
            "-f".to_string(),
            options.dockerfile.to_string_lossy().to_string(),
            "-t".to_string(),
            options.image.clone(),
        ];
        push_creds(&mut args, auth);
        args.push(options.context_dir.to_string_lossy().to_string());

        self.run_logged(&args, log, &format!("Build of image {}", options.image))
            .await
    }

    async fn push_image(&self, image: &str, auth: Option<&RegistryAuth>, log: &LogWriter) -> Result<()> {
        let mut args = vec!["push".to_string()];
        push_creds(&mut args, auth);
        args.push(image.to_string());

        self.run_with_progress(&args, log, &format!("Push of image {}", image))
            .await
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let output = self
            .command()
            .args(["rm", "-f", "-t", "0", name])
            .output()
            .await
            .context("Failed to execute podman rm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("podman rm {} failed: {}", name, stderr.trim());
        }

        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        let output = self
            .command()
            .args(["network", "create", "--ignore", name])
            .output()
            .await
            .context("Failed to execute podman network create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to create network {}: {}", name, stderr.trim());
        }

        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let output = self
            .command()
            .args(["network", "rm", "-f", name])
            .output()
            .await
            .context("Failed to execute podman network rm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to remove network {}: {}", name, stderr.trim());
        }

        Ok(())
    }
}

/// Arguments of `podman run` for a background container
fn run_args(spec: &ContainerSpec) -> Result<Vec<String>> {
    // A retried run reuses container names; replace leftovers of the crashed attempt
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--replace".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for bind in &spec.binds {
        args.push("-v".to_string());
        args.push(bind.clone());
    }

    if let Some(dir) = &spec.working_dir {
        args.push("-w".to_string());
        args.push(dir.clone());
    }

    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
        if let Some(alias) = &spec.network_alias {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
    }

    match &spec.command {
        ContainerCommand::KeepAlive => {
            // Override any image entrypoint so the container idles until removed
            args.extend(["--entrypoint".to_string(), "/bin/sh".to_string()]);
            args.push(spec.image.clone());
            args.extend(["-c".to_string(), "sleep infinity".to_string()]);
        }
        ContainerCommand::ImageDefault => args.push(spec.image.clone()),
        ContainerCommand::Entrypoint(entrypoint) => {
            let entrypoint = serde_json::to_string(entrypoint).context("Failed to encode entrypoint")?;
            args.extend(["--entrypoint".to_string(), entrypoint]);
            args.push(spec.image.clone());
        }
    }

    Ok(args)
}

fn push_creds(args: &mut Vec<String>, auth: Option<&RegistryAuth>) {
    if let Some(auth) = auth {
        args.push("--creds".to_string());
        args.push(format!("{}:{}", auth.username, auth.password));
    }
}

/// Arguments as they may appear in logs
fn redact(args: &[String]) -> Vec<String> {
    let mut redacted = Vec::with_capacity(args.len());
    let mut hide_next = false;

    for arg in args {
        if hide_next {
            redacted.push("***".to_string());
        } else {
            redacted.push(arg.clone());
        }
        hide_next = arg == "--creds";
    }

    redacted
}

async fn copy_progress<R: AsyncRead + Unpin>(stream: R, log: &LogWriter) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => log.line(&mark_layer_progress(&line)),
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading podman output: {}", e);
                break;
            }
        }
    }
}
