//! Run executor
//!
//! Takes one claimed event from start to its final snapshot:
//! - Hands the event back to the queue when no container runtime is usable
//! - Keeps the lease alive while the stages run
//! - Pushes the terminal snapshot, which archives the record
//! - Removes the run's workspace

use anyhow::{Context, Result};
use gantry_core::domain::event::Event;
use gantry_core::domain::record::Status;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::RunContext;
use crate::repository::{EventRepository, is_event_gone};
use crate::runtime::ContainerRuntime;
use crate::stage::StageManager;

pub struct RunExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<dyn EventRepository>,
    stages: StageManager,
    workspace_base: PathBuf,
    lease_renew_interval: Duration,
}

impl RunExecutor {
    /// Creates a new run executor
    ///
    /// # Arguments
    /// * `runtime` - Checked before a run starts
    /// * `events` - Controller event operations
    /// * `stages` - Executes the stages of a run
    /// * `workspace_base` - Base directory of the run workspaces
    /// * `lease_renew_interval` - How often the lease is renewed while running
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<dyn EventRepository>,
        stages: StageManager,
        workspace_base: PathBuf,
        lease_renew_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            events,
            stages,
            workspace_base,
            lease_renew_interval,
        }
    }

    /// Fetches an event by id and runs it
    pub async fn execute_by_id(&self, event_id: Uuid) -> Result<Status> {
        let event = self.events.get_event(event_id).await?;
        self.execute(event).await
    }

    /// Runs an event to completion
    ///
    /// # Returns
    /// Final status of the run's record
    pub async fn execute(&self, event: Event) -> Result<Status> {
        let event_id = event.id;
        let record_id = event.record.id;

        if let Err(e) = self.runtime.check_available().await {
            error!("Container runtime unavailable, handing event {} back: {:#}", event_id, e);
            let event = self.events.reset_event(event_id).await?;
            info!("Event {} requeued (retry {}, eligible at {})", event_id, event.retry, event.in_time);
            return Err(e.context("container runtime unavailable"));
        }

        info!("Running record {} of event {}", record_id, event_id);

        let lease = self.spawn_lease_renewal(event_id);
        let mut ctx = RunContext::new(event, &self.workspace_base);
        self.stages.run(&mut ctx).await;
        lease.abort();

        match tokio::fs::remove_dir_all(ctx.workspace()).await {
            Ok(()) => debug!("Workspace {} removed", ctx.workspace().display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove workspace {}: {}", ctx.workspace().display(), e),
        }

        let status = ctx.record().status;
        self.events
            .update_event(&ctx.event)
            .await
            .with_context(|| format!("Failed to push final status {} of record {}", status, record_id))?;

        info!("Record {} completed with status {}", record_id, status);
        Ok(status)
    }

    /// Renews the event lease until aborted or the event is gone; the first
    /// renewal is immediate
    fn spawn_lease_renewal(&self, event_id: Uuid) -> JoinHandle<()> {
        let events = Arc::clone(&self.events);
        let interval = self.lease_renew_interval;

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);

            loop {
                ticker.tick().await;

                debug!("Renewing lease of event {}", event_id);

                match events.renew_lease(event_id).await {
                    Ok(()) => {}
                    Err(e) if is_event_gone(&e) => {
                        warn!("Event {} no longer exists, stopping lease renewal", event_id);
                        break;
                    }
                    Err(e) => warn!("Failed to renew lease of event {}: {:#}", event_id, e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeEventRepository, FakeRuntime, fake_executor as executor, fake_executor_with_lease, sample_event,
    };
    use gantry_core::domain::record::StageName;

    #[tokio::test]
    async fn test_run_pushes_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let event = sample_event(vec![StageName::CodeCheckout, StageName::Package]);
        let events = Arc::new(FakeEventRepository::with_events(vec![event.clone()]));
        let executor = executor(Arc::new(FakeRuntime::default()), events.clone(), dir.path());

        let status = executor.execute_by_id(event.id).await.unwrap();

        assert_eq!(status, Status::Success);
        let last = events.last_update().unwrap();
        assert_eq!(last.record.status, Status::Success);
        assert!(last.record.end_time.is_some());
        assert!(events.renewals() >= 1);
        assert!(!dir.path().join("ws").join(event.record.id.to_string()).exists());
    }

    #[tokio::test]
    async fn test_unavailable_runtime_requeues_event() {
        let dir = tempfile::tempdir().unwrap();
        let event = sample_event(vec![]);
        let events = Arc::new(FakeEventRepository::with_events(vec![event.clone()]));
        let executor = executor(Arc::new(FakeRuntime::unavailable()), events.clone(), dir.path());

        let err = executor.execute(event.clone()).await.unwrap_err();

        assert!(err.to_string().contains("container runtime unavailable"));
        assert_eq!(events.resets(), vec![event.id]);
        assert!(events.updates().is_empty());
    }

    #[tokio::test]
    async fn test_failed_final_push_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(FakeEventRepository::default().failing_updates());
        let executor = executor(Arc::new(FakeRuntime::default()), events, dir.path());

        let err = executor.execute(sample_event(vec![])).await.unwrap_err();

        assert!(err.to_string().starts_with("Failed to push final status Success"));
    }

    #[tokio::test]
    async fn test_lease_renewal_stops_when_event_gone() {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(FakeEventRepository::default().gone_on_renewal());
        let executor = fake_executor_with_lease(
            Arc::new(FakeRuntime::default()),
            events.clone(),
            dir.path(),
            Duration::from_millis(10),
        );

        let handle = executor.spawn_lease_renewal(Uuid::new_v4());
        time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        assert_eq!(events.renewals(), 1);
    }
}
