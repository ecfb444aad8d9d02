//! Image release stage
//!
//! Pushes the built images that a release policy names. Policies matching no
//! built image are skipped. Pushes run concurrently, one task per policy.

use anyhow::{Context, Result};
use futures::future::join_all;
use gantry_core::domain::log::LogStreamKey;
use gantry_core::domain::record::{StageName, TaskStatus};
use tracing::info;

use super::{StageManager, finish_task, helper, start_task};
use crate::context::RunContext;
use crate::runtime::RegistryAuth;

const STAGE: StageName = StageName::ImageRelease;

impl StageManager {
    pub(super) async fn image_release(&self, ctx: &mut RunContext) -> Result<()> {
        let config = ctx
            .event
            .pipeline
            .build
            .stages
            .image_release
            .clone()
            .context("pipeline has no image release configuration")?;

        let mut matched = Vec::new();
        for policy in &config.release_policies {
            match helper::match_release_image(&ctx.built_images, &policy.image_name) {
                Some(image) => matched.push((policy.image_name.as_str(), image.clone())),
                None => info!("No built image matches release policy {}, skipping", policy.image_name),
            }
        }

        let names = helper::task_names(matched.iter().map(|(policy, _)| *policy));
        let tasks: Vec<TaskStatus> = names
            .into_iter()
            .zip(matched)
            .map(|(name, (_, image))| TaskStatus {
                image: Some(image),
                ..TaskStatus::pending(name)
            })
            .collect();
        self.register_tasks(ctx, STAGE, tasks.clone()).await;

        let auth = self.registry_auth(ctx);
        let base_key = ctx.stream_key(STAGE);

        let pushes = tasks.into_iter().map(|task| {
            let key = base_key.clone().with_task(task.name.clone());
            self.push_task(task, key, auth.as_ref())
        });
        let finished = join_all(pushes).await;

        let total = finished.len();
        let failed = Self::store_tasks(ctx, STAGE, finished);
        if failed > 0 {
            anyhow::bail!("{} of {} image pushes failed", failed, total);
        }
        Ok(())
    }

    async fn push_task(&self, mut task: TaskStatus, key: LogStreamKey, auth: Option<&RegistryAuth>) -> TaskStatus {
        let _permit = self.task_limit.acquire().await.ok();
        start_task(&mut task);

        let image = task.image.clone().unwrap_or_default();
        let outcome: Result<()> = async {
            let pipe = self.open_log(key, STAGE).await?;
            pipe.writer().line(&format!("Pushing {}", image));
            let outcome = self.runtime.push_image(&image, auth, pipe.writer()).await;
            Self::close_log(pipe, STAGE, &outcome).await;
            outcome
        }
        .await;

        finish_task(&mut task, &outcome);
        task
    }
}
