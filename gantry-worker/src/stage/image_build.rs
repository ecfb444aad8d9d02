//! Image build stage
//!
//! One task per build definition, all running concurrently. Untagged image
//! names are tagged with the run's version name. The stage fails when any
//! task fails, after every task has finished.

use anyhow::{Context, Result};
use futures::future::join_all;
use gantry_core::domain::log::LogStreamKey;
use gantry_core::domain::pipeline::ImageBuildInfo;
use gantry_core::domain::record::{StageName, TaskStatus};
use std::path::Path;

use super::helper::{self, DockerfileSource};
use super::{StageManager, finish_task, start_task};
use crate::context::RunContext;
use crate::logpipe::LogWriter;
use crate::runtime::{BuildOptions, RegistryAuth};

const STAGE: StageName = StageName::ImageBuild;

impl StageManager {
    pub(super) async fn image_build(&self, ctx: &mut RunContext) -> Result<()> {
        let config = ctx
            .event
            .pipeline
            .build
            .stages
            .image_build
            .clone()
            .context("pipeline has no image build configuration")?;

        let names = helper::task_names(config.build_infos.iter().map(|info| info.task_name.as_str()));
        let tag = if ctx.record().name.is_empty() {
            ctx.run_slug()
        } else {
            ctx.record().name.clone()
        };

        let tasks: Vec<TaskStatus> = names
            .iter()
            .zip(&config.build_infos)
            .map(|(name, info)| TaskStatus {
                image: Some(helper::format_image_name(&info.image_name, &tag)),
                ..TaskStatus::pending(name.clone())
            })
            .collect();
        self.register_tasks(ctx, STAGE, tasks.clone()).await;

        let workspace = ctx.workspace().to_path_buf();
        let auth = self.registry_auth(ctx);
        let base_key = ctx.stream_key(STAGE);

        let builds = tasks.into_iter().zip(&config.build_infos).map(|(task, info)| {
            let key = base_key.clone().with_task(task.name.clone());
            self.build_task(task, key, &workspace, info, auth.as_ref())
        });
        let finished = join_all(builds).await;

        let total = finished.len();
        let failed = Self::store_tasks(ctx, STAGE, finished);
        ctx.built_images = ctx
            .record()
            .stage_status
            .image_build
            .as_ref()
            .map(|status| status.succeeded_images())
            .unwrap_or_default();

        if failed > 0 {
            anyhow::bail!("{} of {} image builds failed", failed, total);
        }
        Ok(())
    }

    async fn build_task(
        &self,
        mut task: TaskStatus,
        key: LogStreamKey,
        workspace: &Path,
        info: &ImageBuildInfo,
        auth: Option<&RegistryAuth>,
    ) -> TaskStatus {
        let _permit = self.task_limit.acquire().await.ok();
        start_task(&mut task);

        let image = task.image.clone().unwrap_or_default();
        let outcome: Result<()> = async {
            let pipe = self.open_log(key, STAGE).await?;
            let outcome = self
                .build_one(&task.name, &image, workspace, info, auth, pipe.writer())
                .await;
            Self::close_log(pipe, STAGE, &outcome).await;
            outcome
        }
        .await;

        finish_task(&mut task, &outcome);
        task
    }

    async fn build_one(
        &self,
        task: &str,
        image: &str,
        workspace: &Path,
        info: &ImageBuildInfo,
        auth: Option<&RegistryAuth>,
        log: &LogWriter,
    ) -> Result<()> {
        let (context_dir, dockerfile) = helper::resolve_build(workspace, info, task)?;

        if let DockerfileSource::Inline { path, content } = &dockerfile {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            tokio::fs::write(path, content)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        log.line(&format!("Building {} from {}", image, dockerfile.path().display()));

        let options = BuildOptions {
            context_dir,
            dockerfile: dockerfile.path().to_path_buf(),
            image: image.to_string(),
        };
        self.runtime.build_image(&options, auth, log).await
    }
}
