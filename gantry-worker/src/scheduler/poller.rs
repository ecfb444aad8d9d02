//! Event poller
//!
//! Claims events from the controller and executes them. An event is only
//! claimed when a run slot is free, so no lease is held for work that cannot
//! start yet.

use anyhow::Result;
use gantry_core::domain::event::Event;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::repository::EventRepository;
use crate::worker::RunExecutor;

/// Event poller that continuously claims and runs events
pub struct EventPoller {
    events: Arc<dyn EventRepository>,
    executor: Arc<RunExecutor>,
    poll_interval: Duration,
    semaphore: Arc<Semaphore>,
}

impl EventPoller {
    /// Creates a new event poller
    ///
    /// # Arguments
    /// * `events` - Controller event operations
    /// * `executor` - Runs claimed events
    /// * `poll_interval` - Delay between poll cycles
    /// * `max_parallel_runs` - Number of runs executed at the same time
    pub fn new(
        events: Arc<dyn EventRepository>,
        executor: Arc<RunExecutor>,
        poll_interval: Duration,
        max_parallel_runs: usize,
    ) -> Self {
        Self {
            events,
            executor,
            poll_interval,
            semaphore: Arc::new(Semaphore::new(max_parallel_runs.max(1))),
        }
    }

    /// Starts the polling loop
    pub async fn run(&self) -> Result<()> {
        info!("Starting event poller (interval: {:?})", self.poll_interval);

        let mut interval = time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            debug!("Polling for events");

            match self.poll_once().await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} run(s) this cycle", started);
                    }
                }
                Err(e) => {
                    error!("Error during poll cycle: {:#}", e);
                }
            }
        }
    }

    /// Claims events while run slots are free
    ///
    /// # Returns
    /// Number of runs started
    async fn poll_once(&self) -> Result<usize> {
        let mut started = 0;

        loop {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                debug!("Max parallel runs reached, not claiming");
                break;
            };

            match self.events.next_event().await? {
                Some(event) => {
                    self.spawn_run_task(event, permit);
                    started += 1;
                }
                None => {
                    debug!("No events available");
                    break;
                }
            }
        }

        Ok(started)
    }

    /// Spawns a task running a single event
    fn spawn_run_task(&self, event: Event, permit: OwnedSemaphorePermit) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let event_id = event.id;

        tokio::spawn(async move {
            match executor.execute(event).await {
                Ok(status) => info!("Event {} finished: {}", event_id, status),
                Err(e) => error!("Failed to execute event {}: {:#}", event_id, e),
            }
            drop(permit);
        })
    }
}
