//! Event Service
//!
//! Business logic for the event lifecycle: enqueue, claim, status pushes from
//! workers, lease renewal, retry and resolution.

use chrono::Utc;
use gantry_core::domain::event::Event;
use gantry_core::domain::record::{PipelineRecord, Status};
use gantry_core::dto::event::CreateEvent;
use uuid::Uuid;

use crate::repository::{EventStore, RecordStore, StoreError};
use crate::service::log_bus::{LogBus, run_topic};

/// Service error type
#[derive(Debug)]
pub enum EventError {
    NotFound(Uuid),
    ValidationError(String),
    Store(StoreError),
}

impl From<StoreError> for EventError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => EventError::NotFound(id),
            other => EventError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EventError>;

/// Enqueue a new pipeline run
pub async fn create_event(
    events: &dyn EventStore,
    records: &dyn RecordStore,
    req: CreateEvent,
) -> Result<Event> {
    validate_create(&req)?;

    let mut record = PipelineRecord::new(
        req.pipeline.id,
        req.perform_params,
        req.trigger.unwrap_or_else(|| "manual".to_string()),
    );
    record.name = req.name.unwrap_or_default();

    let event = Event::new(req.project, req.pipeline, record, Utc::now());
    let event = events.create_event(event).await?;
    records.save_record(event.project.id, &event.record).await?;

    tracing::info!(
        "Event {} created for pipeline {} (record {})",
        event.id,
        event.pipeline.id,
        event.record.id
    );

    Ok(event)
}

/// Get an event by ID
pub async fn get_event(events: &dyn EventStore, id: Uuid) -> Result<Event> {
    Ok(events.get_event(id).await?)
}

/// Claim the oldest eligible event
pub async fn next_event(events: &dyn EventStore) -> Result<Option<Event>> {
    let event = events.next_event().await?;

    if let Some(event) = &event {
        tracing::info!("Event {} claimed (retry {})", event.id, event.retry);
    }

    Ok(event)
}

/// Apply a status push from the worker holding the event
///
/// The worker owns the embedded snapshot; the queue fields stay as stored.
/// A terminal record resolves the event: the record is archived, viewers are
/// told the stream ended and the event is deleted.
pub async fn update_event(
    events: &dyn EventStore,
    records: &dyn RecordStore,
    bus: &LogBus,
    id: Uuid,
    pushed: Event,
) -> Result<()> {
    if pushed.id != id {
        return Err(EventError::ValidationError(format!(
            "Event id {} does not match path id {}",
            pushed.id, id
        )));
    }

    let mut event = events.get_event(id).await?;
    event.apply_snapshot(pushed);

    records.save_record(event.project.id, &event.record).await?;

    if event.record.is_terminal() {
        let topic = run_topic(event.project.id, event.pipeline.id, event.record.id);
        bus.end(&topic).await;
        events.delete_event(id).await?;

        tracing::info!(
            "Event {} resolved with status {}",
            id,
            event.record.status
        );
        return Ok(());
    }

    events.update_event(&event).await?;
    events.renew_lease(id).await?;
    tracing::debug!("Event {} updated, record status {}", id, event.record.status);

    Ok(())
}

/// Renew the lease of a claimed event
pub async fn renew_lease(events: &dyn EventStore, id: Uuid) -> Result<()> {
    events.renew_lease(id).await?;
    tracing::debug!("Lease renewed for event {}", id);
    Ok(())
}

/// Put an event back in the queue with backoff
pub async fn reset_event(events: &dyn EventStore, id: Uuid) -> Result<Event> {
    let event = events.reset_event(id).await?;
    tracing::warn!(
        "Event {} reset (retry {}), eligible again at {}",
        id,
        event.retry,
        event.in_time
    );
    Ok(event)
}

/// Delete an event
///
/// A run deleted before it finished is archived as `Aborted`, and its log
/// stream is ended either way.
pub async fn delete_event(
    events: &dyn EventStore,
    records: &dyn RecordStore,
    bus: &LogBus,
    id: Uuid,
) -> Result<()> {
    let mut event = events.get_event(id).await?;
    events.delete_event(id).await?;

    if !event.record.is_terminal() {
        event.record.status = Status::Aborted;
        event.record.end_time = Some(Utc::now());
        records.save_record(event.project.id, &event.record).await?;
    }

    let topic = run_topic(event.project.id, event.pipeline.id, event.record.id);
    bus.end(&topic).await;

    tracing::info!("Event {} deleted, record {} is {}", id, event.record.id, event.record.status);
    Ok(())
}

/// Get the archived record of a run
pub async fn get_record(
    records: &dyn RecordStore,
    project_id: Uuid,
    pipeline_id: Uuid,
    record_id: Uuid,
) -> Result<PipelineRecord> {
    records
        .get_record(project_id, pipeline_id, record_id)
        .await?
        .ok_or(EventError::NotFound(record_id))
}

// =============================================================================
// Validation
// =============================================================================

fn validate_create(req: &CreateEvent) -> Result<()> {
    if req.perform_params.reference.trim().is_empty() {
        return Err(EventError::ValidationError(
            "perform_params.ref must not be empty".to_string(),
        ));
    }

    if req.pipeline.project_id != req.project.id {
        return Err(EventError::ValidationError(format!(
            "Pipeline {} does not belong to project {}",
            req.pipeline.id, req.project.id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryEventStore, MemoryRecordStore};
    use crate::service::log_bus::BusMessage;
    use gantry_core::domain::event::QueueStatus;
    use gantry_core::domain::pipeline::{Pipeline, Project};
    use gantry_core::domain::record::{PerformParams, StageName};

    fn create_request() -> CreateEvent {
        let project = Project::default();
        let pipeline = Pipeline {
            project_id: project.id,
            ..Default::default()
        };
        CreateEvent {
            project,
            pipeline,
            perform_params: PerformParams {
                reference: "master".to_string(),
                stages: vec![StageName::CodeCheckout, StageName::Package],
                ..Default::default()
            },
            name: None,
            trigger: None,
        }
    }

    #[tokio::test]
    async fn test_create_event_starts_pending() {
        let events = MemoryEventStore::new();
        let records = MemoryRecordStore::new();

        let event = create_event(&events, &records, create_request()).await.unwrap();

        assert_eq!(event.queue_status, QueueStatus::InQueue);
        assert_eq!(event.record.status, Status::Pending);
        assert_eq!(event.record.trigger, "manual");
        assert!(
            get_record(&records, event.project.id, event.pipeline.id, event.record.id)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_create_event_rejects_empty_ref() {
        let events = MemoryEventStore::new();
        let records = MemoryRecordStore::new();
        let mut req = create_request();
        req.perform_params.reference = " ".to_string();

        let result = create_event(&events, &records, req).await;
        assert!(matches!(result, Err(EventError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_intermediate_update_keeps_queue_state() {
        let events = MemoryEventStore::new();
        let records = MemoryRecordStore::new();
        let bus = LogBus::new();
        let created = create_event(&events, &records, create_request()).await.unwrap();
        let claimed = next_event(&events).await.unwrap().unwrap();

        let mut pushed = claimed.clone();
        pushed.queue_status = QueueStatus::InQueue;
        pushed.retry = 9;
        pushed.record.status = Status::Running;

        update_event(&events, &records, &bus, created.id, pushed).await.unwrap();

        let stored = get_event(&events, created.id).await.unwrap();
        assert_eq!(stored.queue_status, QueueStatus::OutQueue);
        assert_eq!(stored.retry, 0);
        assert_eq!(stored.record.status, Status::Running);
    }

    #[tokio::test]
    async fn test_terminal_update_resolves_event() {
        let events = MemoryEventStore::new();
        let records = MemoryRecordStore::new();
        let bus = LogBus::new();
        let created = create_event(&events, &records, create_request()).await.unwrap();
        let topic = run_topic(created.project.id, created.pipeline.id, created.record.id);
        let mut viewer = bus.subscribe(&topic).await;

        let mut pushed = next_event(&events).await.unwrap().unwrap();
        pushed.record.status = Status::Success;
        update_event(&events, &records, &bus, created.id, pushed).await.unwrap();

        assert!(matches!(
            get_event(&events, created.id).await,
            Err(EventError::NotFound(_))
        ));
        let archived = get_record(&records, created.project.id, created.pipeline.id, created.record.id)
            .await
            .unwrap();
        assert_eq!(archived.status, Status::Success);
        assert_eq!(viewer.recv().await.unwrap(), BusMessage::End);
    }

    #[tokio::test]
    async fn test_update_rejects_mismatched_id() {
        let events = MemoryEventStore::new();
        let records = MemoryRecordStore::new();
        let bus = LogBus::new();
        let created = create_event(&events, &records, create_request()).await.unwrap();

        let result = update_event(&events, &records, &bus, Uuid::new_v4(), created).await;
        assert!(matches!(result, Err(EventError::ValidationError(_))));
    }
}
