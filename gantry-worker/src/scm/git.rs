//! Git provider
//!
//! Shells out to the `git` CLI. Access tokens are injected into the remote
//! URL, which keeps later pushes (tags) authenticated as well.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::record::CommitLog;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::ScmProvider;
use crate::logpipe::LogWriter;

/// `git log` format: id, author, ISO date and subject on separate lines
const COMMIT_FORMAT: &str = "--format=%H%n%an%n%aI%n%s";

#[derive(Debug, Clone, Default)]
pub struct GitScm;

impl GitScm {
    pub fn new() -> Self {
        Self
    }

    /// Runs git with its output going into the stage log
    async fn run_logged(&self, dir: Option<&Path>, args: &[&str], log: &LogWriter) -> Result<()> {
        let mut command = Command::new("git");
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        let status = command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .status()
            .await
            .with_context(|| format!("Failed to execute git {}", args.first().unwrap_or(&"")))?;

        if !status.success() {
            anyhow::bail!(
                "git {} failed with exit code {}",
                args.first().unwrap_or(&""),
                status.code().unwrap_or(-1)
            );
        }

        Ok(())
    }

    async fn head_commit(&self, repo: &Path) -> Result<CommitLog> {
        let output = Command::new("git")
            .current_dir(repo)
            .args(["log", "-1", COMMIT_FORMAT])
            .output()
            .await
            .context("Failed to execute git log")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git log failed: {}", stderr.trim());
        }

        parse_commit_log(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl ScmProvider for GitScm {
    async fn checkout(
        &self,
        url: &str,
        reference: Option<&str>,
        dest: &Path,
        token: &str,
        log: &LogWriter,
    ) -> Result<CommitLog> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        info!("Cloning {} into {}", url, dest.display());
        log.line(&format!("Cloning {} ({})", url, reference.unwrap_or("default branch")));

        let remote = authenticated_url(url, token);
        let dest_str = dest.to_string_lossy();
        self.run_logged(None, &["clone", remote.as_str(), dest_str.as_ref()], log)
            .await?;

        if let Some(reference) = reference {
            self.run_logged(Some(dest), &["fetch", "origin", reference], log)
                .await?;
            self.run_logged(Some(dest), &["checkout", "-qf", "FETCH_HEAD"], log)
                .await?;
        }

        let commit = self.head_commit(dest).await?;
        debug!("Checked out {} at {}", url, commit.id);
        log.line(&format!("HEAD is now at {} {}", commit.id, commit.message));

        Ok(commit)
    }

    async fn create_tag(&self, repo: &Path, tag: &str, commit: &str, log: &LogWriter) -> Result<()> {
        info!("Tagging {} as {} in {}", commit, tag, repo.display());

        self.run_logged(Some(repo), &["tag", "-f", tag, commit], log).await?;
        let refspec = format!("refs/tags/{}", tag);
        self.run_logged(Some(repo), &["push", "-f", "origin", refspec.as_str()], log)
            .await
    }
}

/// Injects an access token into an http(s) URL
fn authenticated_url(url: &str, token: &str) -> String {
    if token.is_empty() {
        return url.to_string();
    }

    for scheme in ["https://", "http://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            return format!("{}{}@{}", scheme, token, rest);
        }
    }

    url.to_string()
}

/// Parses the output of `git log -1` with `COMMIT_FORMAT`
fn parse_commit_log(output: &str) -> Result<CommitLog> {
    let mut lines = output.lines();

    let id = lines.next().map(str::trim).unwrap_or_default();
    if id.is_empty() {
        anyhow::bail!("git log returned no commit");
    }

    let author = lines.next().unwrap_or_default().trim().to_string();
    let date = lines
        .next()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|date| date.with_timezone(&Utc));
    let message = lines.next().unwrap_or_default().trim().to_string();

    Ok(CommitLog {
        id: id.to_string(),
        author,
        date,
        message,
    })
}
