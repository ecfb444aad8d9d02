//! Integration test stage
//!
//! Starts the declared service containers on a network private to the run,
//! each reachable by its service name, then runs the test commands in a
//! container of the built image under test.

use anyhow::{Context, Result};
use gantry_core::domain::record::StageName;

use super::{StageManager, helper, sorted_env};
use crate::context::RunContext;
use crate::logpipe::LogWriter;
use crate::runtime::{ContainerCommand, ContainerGuard, ContainerSpec};

impl StageManager {
    pub(super) async fn integration_test(&self, ctx: &mut RunContext) -> Result<()> {
        let stage = StageName::IntegrationTest;
        let pipe = self.open_log(ctx.stream_key(stage), stage).await?;

        let mut guard = ContainerGuard::new();
        let outcome = self.run_integration(ctx, pipe.writer(), &mut guard).await;
        guard.release(self.runtime.as_ref()).await;

        Self::close_log(pipe, stage, &outcome).await;
        outcome
    }

    async fn run_integration(&self, ctx: &RunContext, log: &LogWriter, guard: &mut ContainerGuard) -> Result<()> {
        let config = ctx
            .event
            .pipeline
            .build
            .stages
            .integration_test
            .as_ref()
            .context("pipeline has no integration test configuration")?;

        let image = helper::find_test_image(&ctx.built_images, &config.config.image_name)
            .with_context(|| format!("image {} was not built by this run", config.config.image_name))?;

        let slug = ctx.run_slug();
        let auth = self.registry_auth(ctx);

        let network = format!("gantry-{}-net", slug);
        guard.track_network(network.clone());
        self.runtime.create_network(&network).await?;

        for service in &config.services {
            if service.name.trim().is_empty() {
                anyhow::bail!("service {} has no name", service.image);
            }

            let mut spec = ContainerSpec::new(format!("gantry-{}-svc-{}", slug, service.name), service.image.clone());
            spec.command = if service.command.is_empty() {
                ContainerCommand::ImageDefault
            } else {
                ContainerCommand::Entrypoint(service.command.clone())
            };
            spec.env = sorted_env(&service.env_vars);
            spec.network = Some(network.clone());
            spec.network_alias = Some(service.name.clone());

            log.line(&format!("Starting service {} ({})", service.name, service.image));
            guard.track_container(spec.name.clone());
            self.runtime
                .start_container(&spec, auth.as_ref(), log)
                .await
                .with_context(|| format!("service {} failed to start", service.name))?;
        }

        let mut spec = ContainerSpec::new(format!("gantry-{}-test", slug), image.clone());
        spec.env = sorted_env(&config.config.env_vars);
        spec.network = Some(network);

        log.line(&format!("Testing {}", image));
        guard.track_container(spec.name.clone());
        let container = self.runtime.start_container(&spec, auth.as_ref(), log).await?;

        for command in &config.config.command {
            log.line(&format!("$ {}", command));
            let code = self.runtime.exec(&container, command, None, log).await?;
            if code != 0 {
                anyhow::bail!("command `{}` exited with code {}", command, code);
            }
        }

        Ok(())
    }
}
