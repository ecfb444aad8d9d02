//! Source control capability

mod git;

pub use git::GitScm;

use anyhow::Result;
use async_trait::async_trait;
use gantry_core::domain::record::CommitLog;
use std::path::Path;

use crate::logpipe::LogWriter;

/// Source control operations used by the stages
#[async_trait]
pub trait ScmProvider: Send + Sync {
    /// Clones `url` into `dest` and checks out `reference`
    ///
    /// # Arguments
    /// * `url` - Repository URL
    /// * `reference` - Branch, tag or ref to check out; the default branch when `None`
    /// * `dest` - Directory to clone into, must not exist yet
    /// * `token` - Access token, empty for public repositories
    /// * `log` - Stage log receiving the command output
    ///
    /// # Returns
    /// The checked-out commit
    async fn checkout(
        &self,
        url: &str,
        reference: Option<&str>,
        dest: &Path,
        token: &str,
        log: &LogWriter,
    ) -> Result<CommitLog>;

    /// Creates `tag` on `commit` and pushes it to the origin remote
    async fn create_tag(&self, repo: &Path, tag: &str, commit: &str, log: &LogWriter) -> Result<()>;
}
