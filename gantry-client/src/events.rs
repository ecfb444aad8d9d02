//! Event and record API endpoints

use crate::ControllerClient;
use crate::error::Result;
use gantry_core::domain::event::Event;
use gantry_core::domain::record::PipelineRecord;
use gantry_core::dto::event::CreateEvent;
use uuid::Uuid;

impl ControllerClient {
    // =============================================================================
    // Event Lifecycle
    // =============================================================================

    /// Enqueue a new pipeline run
    pub async fn create_event(&self, req: CreateEvent) -> Result<Event> {
        let url = format!("{}/api/v1/events", self.base_url);
        let response = self.client.post(&url).json(&req).send().await?;

        self.handle_response(response).await
    }

    /// Get an event by ID
    ///
    /// # Arguments
    /// * `event_id` - The event UUID
    pub async fn get_event(&self, event_id: Uuid) -> Result<Event> {
        let url = format!("{}/api/v1/events/{}", self.base_url, event_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// Push the worker-owned part of an event (record, commit info, status)
    ///
    /// The controller keeps its own queue fields and renews the lease. A
    /// terminal record resolves the event.
    pub async fn update_event(&self, event: &Event) -> Result<()> {
        let url = format!("{}/api/v1/events/{}", self.base_url, event.id);
        let response = self.client.put(&url).json(event).send().await?;

        self.handle_empty_response(response).await
    }

    /// Claim the oldest eligible event
    ///
    /// # Returns
    /// `None` when nothing is eligible; callers are expected to poll.
    pub async fn next_event(&self) -> Result<Option<Event>> {
        let url = format!("{}/api/v1/events/next", self.base_url);
        let response = self.client.post(&url).send().await?;

        self.handle_optional_response(response).await
    }

    /// Renew the lease on a claimed event
    pub async fn renew_lease(&self, event_id: Uuid) -> Result<()> {
        let url = format!("{}/api/v1/events/{}/lease", self.base_url, event_id);
        let response = self.client.post(&url).send().await?;

        self.handle_empty_response(response).await
    }

    /// Hand an event back to the queue with retry backoff
    ///
    /// # Returns
    /// The re-enqueued event, with its new retry count and eligibility time
    pub async fn reset_event(&self, event_id: Uuid) -> Result<Event> {
        let url = format!("{}/api/v1/events/{}/reset", self.base_url, event_id);
        let response = self.client.post(&url).send().await?;

        self.handle_response(response).await
    }

    /// Delete an event
    pub async fn delete_event(&self, event_id: Uuid) -> Result<()> {
        let url = format!("{}/api/v1/events/{}", self.base_url, event_id);
        let response = self.client.delete(&url).send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Records
    // =============================================================================

    /// Get the archived record of a run
    pub async fn get_record(
        &self,
        project_id: Uuid,
        pipeline_id: Uuid,
        record_id: Uuid,
    ) -> Result<PipelineRecord> {
        let url = format!(
            "{}/api/v1/projects/{}/pipelines/{}/records/{}",
            self.base_url, project_id, pipeline_id, record_id
        );
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
