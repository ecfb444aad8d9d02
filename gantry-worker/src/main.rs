//! Gantry Worker
//!
//! Executes pipeline runs: checks out code, packages it in a builder
//! container, builds, tests and releases images, and tags the commit.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Repositories: Communication with the controller (events, log streams)
//! - Runtime / SCM: Container runtime and git, behind traits
//! - Stages: The stage manager and the stages it drives
//! - Log pipe: Local stage log buffers forwarded live to the controller
//! - Scheduler: Event polling and run lifecycle
//!
//! The worker either runs the single event named by `EVENT_ID` and exits, or
//! polls the controller for eligible events.

mod config;
mod context;
mod logpipe;
mod repository;
mod runtime;
mod scheduler;
mod scm;
mod stage;
#[cfg(test)]
mod testing;
mod worker;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::logpipe::LogPipeFactory;
use crate::repository::{EventRepository, HttpEventRepository, WsLogStreamConnector};
use crate::runtime::{ContainerRuntime, PodmanRuntime};
use crate::scheduler::EventPoller;
use crate::scm::GitScm;
use crate::stage::StageManager;
use crate::worker::RunExecutor;
use gantry_client::ControllerClient;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gantry Worker");

    // Load configuration
    let config = load_config()?;
    info!(
        "Loaded configuration: worker_id={}, controller_url={}",
        config.worker_id, config.controller_url
    );

    // Initialize controller client
    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let client = Arc::new(ControllerClient::with_client(config.controller_url.clone(), http));

    info!("Controller client initialized");

    // Initialize services
    let events: Arc<dyn EventRepository> = Arc::new(HttpEventRepository::new(Arc::clone(&client)));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(PodmanRuntime::default());
    let pipes = LogPipeFactory::new(
        config.log_dir.clone(),
        Arc::new(WsLogStreamConnector::new(Arc::clone(&client))),
        config.log_flush_grace,
    );
    let stages = StageManager::new(
        Arc::clone(&runtime),
        Arc::new(GitScm::new()),
        Arc::clone(&events),
        pipes,
        config.registry.clone(),
        config.max_parallel_tasks,
    );
    let executor = Arc::new(RunExecutor::new(
        runtime,
        Arc::clone(&events),
        stages,
        config.workspace_base.clone(),
        config.lease_renew_interval,
    ));

    info!("Worker initialized successfully");

    if let Some(event_id) = config.event_id {
        info!("Running event {}", event_id);
        let status = executor.execute_by_id(event_id).await?;
        info!("Event {} finished with status {}", event_id, status);
        return Ok(());
    }

    info!(
        "Poll interval: {:?}, max parallel runs: {}",
        config.poll_interval, config.max_parallel_runs
    );

    // Start polling loop
    let poller = EventPoller::new(events, executor, config.poll_interval, config.max_parallel_runs);
    if let Err(e) = poller.run().await {
        error!("Poller error: {}", e);
        return Err(e);
    }

    Ok(())
}

/// Loads configuration from environment variables with fallback to defaults
///
/// A malformed `EVENT_ID` aborts start-up instead of falling back.
fn load_config() -> Result<Config> {
    let event_id = Config::event_id_from_env()?;
    let config = Config::or_default(Config::from_env(), event_id);
    config.validate()?;
    Ok(config)
}
