//! Repository Module
//!
//! Data access layer for the controller. The event store and the record
//! archive each sit behind a trait with a Postgres and an in-memory backend.

pub mod event;
pub mod memory;
pub mod record;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::event::Event;
use gantry_core::domain::record::PipelineRecord;
use thiserror::Error;
use uuid::Uuid;

pub use event::PgEventStore;
pub use memory::{MemoryEventStore, MemoryRecordStore};
pub use record::PgRecordStore;

/// Errors raised by the persistence layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("failed to (de)serialize stored snapshot: {0}")]
    Serialization(String),

    /// An update keyed by id touched more than one row
    #[error("more than one event matched id {0}")]
    MultipleMatch(Uuid),

    #[error("event {0} not found")]
    NotFound(Uuid),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Time source for queue decisions
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Lease-based event queue
///
/// `next_event` is the single point of mutual exclusion between workers: the
/// select and the claim happen in one atomic step, so an eligible event is
/// handed to at most one caller per lease window.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persists a new event as `InQueue` with `in_time = now`
    async fn create_event(&self, event: Event) -> StoreResult<Event>;

    async fn get_event(&self, id: Uuid) -> StoreResult<Event>;

    /// Claims the oldest eligible event, or returns `None`
    async fn next_event(&self) -> StoreResult<Option<Event>>;

    /// Overwrites the whole event
    async fn update_event(&self, event: &Event) -> StoreResult<()>;

    /// Re-enqueues an event with retry backoff
    async fn reset_event(&self, id: Uuid) -> StoreResult<Event>;

    /// Marks the event as held by a worker as of now
    async fn renew_lease(&self, id: Uuid) -> StoreResult<()>;

    async fn delete_event(&self, id: Uuid) -> StoreResult<()>;
}

/// Archive of pipeline records, kept after their event is resolved
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn save_record(&self, project_id: Uuid, record: &PipelineRecord) -> StoreResult<()>;

    async fn get_record(
        &self,
        project_id: Uuid,
        pipeline_id: Uuid,
        record_id: Uuid,
    ) -> StoreResult<Option<PipelineRecord>>;
}
