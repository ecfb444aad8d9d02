//! Events repository
//!
//! Handles communication with the controller for event operations:
//! - Fetching and claiming events
//! - Pushing status updates
//! - Renewing the lease of a running event
//! - Handing an event back to the queue

use anyhow::{Context, Result};
use async_trait::async_trait;
use gantry_client::{ClientError, ControllerClient};
use gantry_core::domain::event::Event;
use std::sync::Arc;
use uuid::Uuid;

/// Repository trait for event operations with the controller
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Fetches an event by id
    async fn get_event(&self, event_id: Uuid) -> Result<Event>;

    /// Claims the oldest eligible event, `None` when the queue is idle
    async fn next_event(&self) -> Result<Option<Event>>;

    /// Pushes the current snapshot of a run
    ///
    /// # Arguments
    /// * `event` - The event with its updated record
    async fn update_event(&self, event: &Event) -> Result<()>;

    /// Renews the lease held on a running event
    async fn renew_lease(&self, event_id: Uuid) -> Result<()>;

    /// Puts the event back in the queue with retry backoff
    async fn reset_event(&self, event_id: Uuid) -> Result<Event>;
}

/// Whether the controller no longer knows the event an operation targeted
pub fn is_event_gone(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ClientError>()
        .is_some_and(ClientError::is_not_found)
}

/// HTTP implementation of EventRepository
pub struct HttpEventRepository {
    client: Arc<ControllerClient>,
}

impl HttpEventRepository {
    /// Creates a new HTTP event repository
    ///
    /// # Arguments
    /// * `client` - Shared controller client
    pub fn new(client: Arc<ControllerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventRepository for HttpEventRepository {
    async fn get_event(&self, event_id: Uuid) -> Result<Event> {
        self.client
            .get_event(event_id)
            .await
            .with_context(|| format!("Failed to fetch event {}", event_id))
    }

    async fn next_event(&self) -> Result<Option<Event>> {
        self.client
            .next_event()
            .await
            .context("Failed to claim next event")
    }

    async fn update_event(&self, event: &Event) -> Result<()> {
        self.client
            .update_event(event)
            .await
            .with_context(|| format!("Failed to update event {}", event.id))
    }

    async fn renew_lease(&self, event_id: Uuid) -> Result<()> {
        self.client
            .renew_lease(event_id)
            .await
            .with_context(|| format!("Failed to renew lease of event {}", event_id))
    }

    async fn reset_event(&self, event_id: Uuid) -> Result<Event> {
        self.client
            .reset_event(event_id)
            .await
            .with_context(|| format!("Failed to reset event {}", event_id))
    }
}
