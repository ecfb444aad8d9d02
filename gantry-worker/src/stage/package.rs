//! Package stage
//!
//! Runs the unit test commands, then the package commands, inside one
//! builder container with the workspace mounted at the same path. Outputs in
//! the workspace are visible on the host through the mount; others are
//! copied out into the workspace.

use anyhow::{Context, Result};
use gantry_core::domain::record::StageName;

use super::helper::{self, OutputLocation};
use super::{StageManager, sorted_env};
use crate::context::RunContext;
use crate::logpipe::LogWriter;
use crate::runtime::{ContainerGuard, ContainerSpec};

impl StageManager {
    pub(super) async fn package(&self, ctx: &mut RunContext) -> Result<()> {
        let stage = StageName::Package;
        let pipe = self.open_log(ctx.stream_key(stage), stage).await?;

        let mut guard = ContainerGuard::new();
        let outcome = self.build_package(ctx, pipe.writer(), &mut guard).await;
        guard.release(self.runtime.as_ref()).await;

        Self::close_log(pipe, stage, &outcome).await;
        outcome
    }

    async fn build_package(&self, ctx: &RunContext, log: &LogWriter, guard: &mut ContainerGuard) -> Result<()> {
        let build = &ctx.event.pipeline.build;
        let builder = build
            .builder_image
            .as_ref()
            .context("pipeline has no builder image")?;
        let package = build
            .stages
            .package
            .as_ref()
            .context("pipeline has no package configuration")?;

        let commands: Vec<&str> = build
            .stages
            .unit_test
            .iter()
            .flat_map(|unit_test| unit_test.command.iter())
            .chain(package.command.iter())
            .map(String::as_str)
            .collect();

        let workspace = ctx.workspace().to_string_lossy().into_owned();
        let mut spec = ContainerSpec::new(format!("gantry-{}-package", ctx.run_slug()), builder.image.clone());
        spec.env = sorted_env(&builder.env_vars);
        spec.binds.push(format!("{}:{}", workspace, workspace));
        if let Some(bind) = helper::cache_bind(build.build_info.as_ref(), &ctx.record().perform_params) {
            spec.binds.push(bind);
        }
        spec.working_dir = Some(workspace);

        let auth = self.registry_auth(ctx);
        guard.track_container(spec.name.clone());
        let container = self
            .runtime
            .start_container(&spec, auth.as_ref(), log)
            .await
            .with_context(|| format!("failed to start builder {}", builder.image))?;

        for command in commands {
            log.line(&format!("$ {}", command));
            let code = self.runtime.exec(&container, command, None, log).await?;
            if code != 0 {
                anyhow::bail!("command `{}` exited with code {}", command, code);
            }
        }

        for output in &package.outputs {
            match helper::resolve_output(ctx.workspace(), output)? {
                OutputLocation::Workspace(path) => {
                    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                        anyhow::bail!("output {} was not produced", output);
                    }
                }
                OutputLocation::Container(path) => {
                    self.runtime
                        .copy_from_container(&container, &path, ctx.workspace(), log)
                        .await?;
                }
            }
            log.line(&format!("Collected output {}", output));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::context::RunContext;
    use crate::logpipe::LogPipeFactory;
    use crate::stage::StageManager;
    use crate::testing::{FakeConnector, FakeEventRepository, FakeRuntime, FakeScm, sample_event};
    use gantry_core::domain::pipeline::{BuildInfo, BuildTool};
    use std::sync::Arc;
    use std::time::Duration;

    fn manager(runtime: Arc<FakeRuntime>, dir: &std::path::Path) -> StageManager {
        StageManager::new(
            runtime,
            Arc::new(FakeScm::default()),
            Arc::new(FakeEventRepository::default()),
            LogPipeFactory::new(dir.join("logs"), Arc::new(FakeConnector::default()), Duration::ZERO),
            None,
            1,
        )
    }

    #[tokio::test]
    async fn test_builder_mounts_workspace_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());

        let mut event = sample_event(vec![]);
        event.record.perform_params.cache_dependency = true;
        event.pipeline.build.build_info = Some(BuildInfo {
            build_tool: Some(BuildTool::Maven),
            cache_dependency: true,
        });

        let mut ctx = RunContext::new(event, &dir.path().join("ws"));
        manager(runtime.clone(), dir.path()).package(&mut ctx).await.unwrap();

        let spec = &runtime.started()[0];
        let workspace = ctx.workspace().to_string_lossy().into_owned();
        assert_eq!(spec.binds[0], format!("{}:{}", workspace, workspace));
        assert_eq!(spec.binds[1], "/root/.m2:/root/.m2");
        assert_eq!(spec.working_dir.as_deref(), Some(workspace.as_str()));
    }

    #[tokio::test]
    async fn test_outputs_collected() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());

        let mut event = sample_event(vec![]);
        let package = event.pipeline.build.stages.package.as_mut().unwrap();
        package.outputs = vec!["target/app.jar".into(), "/opt/reports".into()];

        let mut ctx = RunContext::new(event, &dir.path().join("ws"));
        std::fs::create_dir_all(ctx.workspace().join("target")).unwrap();
        std::fs::write(ctx.workspace().join("target/app.jar"), b"jar").unwrap();

        manager(runtime.clone(), dir.path()).package(&mut ctx).await.unwrap();

        let copies = runtime.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].1, "/opt/reports");
    }

    #[tokio::test]
    async fn test_missing_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());

        let mut event = sample_event(vec![]);
        event.pipeline.build.stages.package.as_mut().unwrap().outputs = vec!["target/app.jar".into()];

        let mut ctx = RunContext::new(event, &dir.path().join("ws"));
        let err = manager(runtime.clone(), dir.path()).package(&mut ctx).await.unwrap_err();

        assert_eq!(err.to_string(), "output target/app.jar was not produced");
        assert_eq!(runtime.removal_attempts().len(), 1);
    }
}
