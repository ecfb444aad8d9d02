//! SCM tag stage
//!
//! Tags the checked-out main commit with the run's version name and pushes
//! the tag. A failure here is recorded on the stage only.

use anyhow::{Context, Result};
use gantry_core::domain::record::StageName;

use super::StageManager;
use crate::context::RunContext;
use crate::logpipe::LogWriter;

impl StageManager {
    pub(super) async fn create_scm_tag(&self, ctx: &mut RunContext) -> Result<()> {
        let stage = StageName::CreateScmTag;
        let pipe = self.open_log(ctx.stream_key(stage), stage).await?;
        let outcome = self.tag_commit(ctx, pipe.writer()).await;
        Self::close_log(pipe, stage, &outcome).await;
        outcome
    }

    async fn tag_commit(&self, ctx: &RunContext, log: &LogWriter) -> Result<()> {
        let record = ctx.record();
        let commit = record
            .stage_status
            .code_checkout
            .as_ref()
            .and_then(|status| status.commits.main_repo.as_ref())
            .context("no commit was checked out")?;

        if record.name.is_empty() {
            anyhow::bail!("run has no version name to tag with");
        }

        log.line(&format!("Tagging {} as {}", commit.id, record.name));
        self.scm.create_tag(ctx.workspace(), &record.name, &commit.id, log).await
    }
}
