//! Stage manager
//!
//! Drives one run through its stages in the fixed order:
//! code checkout, package, image build, integration test, image release and
//! SCM tag. Code checkout and package always run; the others run when the
//! run asks for them.
//!
//! Every stage follows the same protocol:
//! 1. Mark the stage running and push the snapshot
//! 2. Open the stage log and write the start marker
//! 3. Do the work, tracking containers for cleanup
//! 4. Write the finish (or failure) marker and close the log
//! 5. Remove the stage's containers
//! 6. Store the outcome and push the snapshot
//!
//! The first failing stage fails the run and no later stage is attempted.
//! Image build and image release fan out into tasks that run concurrently,
//! bounded by a task limit, each with its own log stream.

mod checkout;
mod helper;
mod image_build;
mod integration;
mod package;
mod release;
mod tag;

use anyhow::Result;
use chrono::Utc;
use gantry_core::domain::log::LogStreamKey;
use gantry_core::domain::pipeline::Registry;
use gantry_core::domain::record::{StageName, StageStatus, Status, TaskStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::logpipe::{LogPipe, LogPipeFactory};
use crate::repository::EventRepository;
use crate::runtime::{ContainerRuntime, RegistryAuth};
use crate::scm::ScmProvider;

/// Executes the stages of a run
pub struct StageManager {
    runtime: Arc<dyn ContainerRuntime>,
    scm: Arc<dyn ScmProvider>,
    events: Arc<dyn EventRepository>,
    pipes: LogPipeFactory,
    /// Registry used when the project has none
    registry: Option<Registry>,
    task_limit: Semaphore,
}

impl StageManager {
    /// Creates a new stage manager
    ///
    /// # Arguments
    /// * `runtime` - Container runtime the stages run in
    /// * `scm` - Source control provider for checkout and tagging
    /// * `events` - Where intermediate snapshots are pushed
    /// * `pipes` - Opens the stage log pipes
    /// * `registry` - Fallback registry credentials
    /// * `max_parallel_tasks` - Bound on concurrently running fan-out tasks
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        scm: Arc<dyn ScmProvider>,
        events: Arc<dyn EventRepository>,
        pipes: LogPipeFactory,
        registry: Option<Registry>,
        max_parallel_tasks: usize,
    ) -> Self {
        Self {
            runtime,
            scm,
            events,
            pipes,
            registry,
            task_limit: Semaphore::new(max_parallel_tasks.max(1)),
        }
    }

    /// Runs every requested stage and sets the final record status
    ///
    /// A record that is already terminal is left untouched. Stage failures
    /// end up in the record, never in the return value; the caller pushes the
    /// final snapshot.
    pub async fn run(&self, ctx: &mut RunContext) {
        let record_id = ctx.record().id;

        if ctx.record().is_terminal() {
            warn!("Record {} is already {}, skipping", record_id, ctx.record().status);
            return;
        }

        // A retried run starts over from scratch
        {
            let record = ctx.record_mut();
            record.status = Status::Running;
            record.start_time = Some(Utc::now());
            record.end_time = None;
            record.error_message.clear();
            record.stage_status = StageStatus::default();
        }
        ctx.built_images.clear();
        self.report(ctx).await;

        for stage in StageName::ORDER {
            if ctx.record().is_terminal() {
                break;
            }

            if !ctx.record().perform_params.requests(stage) {
                debug!("Record {}: stage {} not requested", record_id, stage);
                continue;
            }

            self.execute(ctx, stage).await;
        }

        let record = ctx.record_mut();
        if record.status == Status::Running {
            record.status = Status::Success;
        }
        record.end_time = Some(Utc::now());

        info!("Record {} finished with status {}", record_id, record.status);
    }

    async fn execute(&self, ctx: &mut RunContext, stage: StageName) {
        let record_id = ctx.record().id;
        info!("Record {}: stage {} started", record_id, stage);

        ctx.start_stage(stage);
        self.report(ctx).await;

        let outcome = match stage {
            StageName::CodeCheckout => self.code_checkout(ctx).await,
            StageName::Package => self.package(ctx).await,
            StageName::ImageBuild => self.image_build(ctx).await,
            StageName::IntegrationTest => self.integration_test(ctx).await,
            StageName::ImageRelease => self.image_release(ctx).await,
            StageName::CreateScmTag => self.create_scm_tag(ctx).await,
        };

        match &outcome {
            Ok(()) => info!("Record {}: stage {} succeeded", record_id, stage),
            Err(e) => error!("Record {}: stage {} failed: {:#}", record_id, stage, e),
        }

        ctx.finish_stage(stage, &outcome);
        self.report(ctx).await;
    }

    /// Pushes the current snapshot; failures only lose visibility
    async fn report(&self, ctx: &RunContext) {
        if let Err(e) = self.events.update_event(&ctx.event).await {
            warn!("Failed to push progress of record {}: {:#}", ctx.record().id, e);
        }
    }

    /// Credentials for registry operations, the project's registry first
    fn registry_auth(&self, ctx: &RunContext) -> Option<RegistryAuth> {
        ctx.event
            .project
            .registry
            .as_ref()
            .or(self.registry.as_ref())
            .and_then(RegistryAuth::from_registry)
    }

    /// Opens a log pipe and writes the start marker
    async fn open_log(&self, key: LogStreamKey, stage: StageName) -> Result<LogPipe> {
        let pipe = self.pipes.open(key).await?;
        pipe.writer().line(&helper::start_marker(stage));
        Ok(pipe)
    }

    /// Writes the finish marker and closes the pipe after the flush grace
    async fn close_log(pipe: LogPipe, stage: StageName, outcome: &Result<()>) {
        pipe.writer().line(&helper::finish_marker(stage, outcome));
        pipe.close().await;
    }

    /// Registers the pending tasks of a fan-out stage and pushes them
    async fn register_tasks(&self, ctx: &mut RunContext, stage: StageName, tasks: Vec<TaskStatus>) {
        if let Some(slot) = ctx.record_mut().stage_status.tasks_mut(stage) {
            *slot = tasks;
        }
        self.report(ctx).await;
    }

    /// Stores the final task statuses of a fan-out stage
    ///
    /// # Returns
    /// Number of failed tasks
    fn store_tasks(ctx: &mut RunContext, stage: StageName, tasks: Vec<TaskStatus>) -> usize {
        let failed = tasks.iter().filter(|t| t.status == Status::Failed).count();
        if let Some(slot) = ctx.record_mut().stage_status.tasks_mut(stage) {
            *slot = tasks;
        }
        failed
    }
}

/// Marks a task running
fn start_task(task: &mut TaskStatus) {
    task.status = Status::Running;
    task.start_time = Some(Utc::now());
}

/// Records the outcome of a task
fn finish_task(task: &mut TaskStatus, outcome: &Result<()>) {
    task.end_time = Some(Utc::now());
    match outcome {
        Ok(()) => task.status = Status::Success,
        Err(e) => {
            warn!("Task {} failed: {:#}", task.name, e);
            task.status = Status::Failed;
        }
    }
}

fn sorted_env(vars: &HashMap<String, String>) -> BTreeMap<String, String> {
    vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}
