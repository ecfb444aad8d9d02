//! Code checkout stage
//!
//! Clones the main repository into a fresh workspace, then every dependent
//! repository into its folder under it. The main commit names the run when
//! the record has no name yet.

use anyhow::{Context, Result};
use chrono::Utc;
use gantry_core::domain::record::{Commits, StageName};
use tracing::debug;

use super::{StageManager, helper};
use crate::context::RunContext;
use crate::logpipe::LogWriter;

impl StageManager {
    pub(super) async fn code_checkout(&self, ctx: &mut RunContext) -> Result<()> {
        let stage = StageName::CodeCheckout;
        let pipe = self.open_log(ctx.stream_key(stage), stage).await?;
        let outcome = self.checkout_sources(ctx, pipe.writer()).await;
        Self::close_log(pipe, stage, &outcome).await;
        outcome
    }

    async fn checkout_sources(&self, ctx: &mut RunContext, log: &LogWriter) -> Result<()> {
        let config = ctx
            .event
            .pipeline
            .build
            .stages
            .code_checkout
            .clone()
            .context("pipeline has no code checkout configuration")?;

        let workspace = ctx.workspace().to_path_buf();
        if tokio::fs::try_exists(&workspace).await.unwrap_or(false) {
            debug!("Removing stale workspace {}", workspace.display());
            tokio::fs::remove_dir_all(&workspace)
                .await
                .with_context(|| format!("failed to clear workspace {}", workspace.display()))?;
        }

        let token = ctx.event.project.scm.token.clone();
        let requested = ctx.record().perform_params.reference.trim().to_string();
        let main_ref = if requested.is_empty() {
            config.main_repo.reference.as_deref()
        } else {
            Some(requested.as_str())
        };

        let main = self
            .scm
            .checkout(&config.main_repo.url, main_ref, &workspace, &token, log)
            .await
            .with_context(|| format!("failed to check out {}", config.main_repo.url))?;

        let mut dep_commits = Vec::with_capacity(config.dep_repos.len());
        for dep in &config.dep_repos {
            let dest = helper::safe_join(&workspace, &dep.folder)?;
            if dest == workspace {
                anyhow::bail!("dependent repository {} has no folder", dep.source.url);
            }

            let commit = self
                .scm
                .checkout(&dep.source.url, dep.source.reference.as_deref(), &dest, &token, log)
                .await
                .with_context(|| format!("failed to check out {}", dep.source.url))?;
            dep_commits.push(commit);
        }

        let started = ctx.record().start_time.unwrap_or_else(Utc::now);
        let version = helper::version_name(&main.id, started);

        let record = ctx.record_mut();
        if record.name.is_empty() {
            record.name = version;
        }
        let name = record.name.clone();
        log.line(&format!("Version: {}", name));

        let status = record.stage_status.code_checkout.get_or_insert_with(Default::default);
        status.commits = Commits {
            main_repo: Some(main),
            dep_repos: dep_commits,
        };
        status.version = Some(name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::context::RunContext;
    use crate::logpipe::LogPipeFactory;
    use crate::stage::StageManager;
    use crate::testing::{FakeConnector, FakeEventRepository, FakeRuntime, FakeScm, sample_event};
    use gantry_core::domain::pipeline::{CodeSource, DepRepo};
    use gantry_core::domain::record::{StageName, Status};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dependent_repos_checked_out_into_folders() {
        let dir = tempfile::tempdir().unwrap();
        let scm = Arc::new(FakeScm::default());
        let manager = StageManager::new(
            Arc::new(FakeRuntime::default()),
            scm.clone(),
            Arc::new(FakeEventRepository::default()),
            LogPipeFactory::new(dir.path().join("logs"), Arc::new(FakeConnector::default()), Duration::ZERO),
            None,
            1,
        );

        let mut event = sample_event(vec![]);
        let checkout = event.pipeline.build.stages.code_checkout.as_mut().unwrap();
        checkout.dep_repos.push(DepRepo {
            source: CodeSource {
                url: "https://git.example.com/acme/lib.git".into(),
                reference: Some("v2".into()),
            },
            folder: "vendor/lib".into(),
        });

        let mut ctx = RunContext::new(event, &dir.path().join("ws"));
        ctx.start_stage(StageName::CodeCheckout);
        manager.code_checkout(&mut ctx).await.unwrap();

        let checkouts = scm.checkouts();
        assert_eq!(checkouts.len(), 2);
        assert_eq!(checkouts[0].1.as_deref(), Some("main"));
        assert_eq!(checkouts[0].2, ctx.workspace());
        assert_eq!(checkouts[1].1.as_deref(), Some("v2"));
        assert_eq!(checkouts[1].2, ctx.workspace().join("vendor/lib"));

        let status = ctx.record().stage_status.code_checkout.as_ref().unwrap();
        assert_eq!(status.general.status, Status::Running);
        assert_eq!(status.commits.dep_repos.len(), 1);
    }

    #[tokio::test]
    async fn test_dependent_repo_outside_workspace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StageManager::new(
            Arc::new(FakeRuntime::default()),
            Arc::new(FakeScm::default()),
            Arc::new(FakeEventRepository::default()),
            LogPipeFactory::new(dir.path().join("logs"), Arc::new(FakeConnector::default()), Duration::ZERO),
            None,
            1,
        );

        let mut event = sample_event(vec![]);
        event.pipeline.build.stages.code_checkout.as_mut().unwrap().dep_repos.push(DepRepo {
            source: CodeSource {
                url: "https://git.example.com/acme/lib.git".into(),
                reference: None,
            },
            folder: "../lib".into(),
        });

        let mut ctx = RunContext::new(event, &dir.path().join("ws"));
        let err = manager.code_checkout(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("must stay inside the workspace"));
    }
}
