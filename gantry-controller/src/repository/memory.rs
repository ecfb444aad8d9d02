//! In-memory backends
//!
//! Used for local development (`GANTRY_STORE=memory`) and tests. All queue
//! decisions go through a single mutex, which makes the claim atomic.

use async_trait::async_trait;
use gantry_core::domain::event::{Event, QueueStatus};
use gantry_core::domain::record::PipelineRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Clock, EventStore, RecordStore, StoreError, StoreResult, SystemClock};

struct Slot {
    /// Insertion order, breaks `in_time` ties
    seq: u64,
    event: Event,
}

#[derive(Default)]
struct Queue {
    next_seq: u64,
    slots: HashMap<Uuid, Slot>,
}

pub struct MemoryEventStore {
    queue: Mutex<Queue>,
    clock: Arc<dyn Clock>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            clock,
        }
    }
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_event(&self, mut event: Event) -> StoreResult<Event> {
        event.queue_status = QueueStatus::InQueue;
        event.in_time = self.clock.now();

        let mut queue = self.queue.lock().await;
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.slots.insert(
            event.id,
            Slot {
                seq,
                event: event.clone(),
            },
        );

        Ok(event)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Event> {
        let queue = self.queue.lock().await;
        queue
            .slots
            .get(&id)
            .map(|slot| slot.event.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn next_event(&self) -> StoreResult<Option<Event>> {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;

        let oldest = queue
            .slots
            .values_mut()
            .filter(|slot| slot.event.is_claimable(now))
            .min_by_key(|slot| (slot.event.in_time, slot.seq));

        Ok(oldest.map(|slot| {
            slot.event.claim(now);
            slot.event.clone()
        }))
    }

    async fn update_event(&self, event: &Event) -> StoreResult<()> {
        let mut queue = self.queue.lock().await;
        let slot = queue.slots.get_mut(&event.id).ok_or(StoreError::NotFound(event.id))?;
        slot.event = event.clone();
        Ok(())
    }

    async fn reset_event(&self, id: Uuid) -> StoreResult<Event> {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let slot = queue.slots.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        slot.event.reset(now);
        Ok(slot.event.clone())
    }

    async fn renew_lease(&self, id: Uuid) -> StoreResult<()> {
        let now = self.clock.now();
        let mut queue = self.queue.lock().await;
        let slot = queue.slots.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        slot.event.claim(now);
        Ok(())
    }

    async fn delete_event(&self, id: Uuid) -> StoreResult<()> {
        let mut queue = self.queue.lock().await;
        queue
            .slots
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }
}

/// Record archive keyed by record id, with the owning project
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<Uuid, (Uuid, PipelineRecord)>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save_record(&self, project_id: Uuid, record: &PipelineRecord) -> StoreResult<()> {
        self.records
            .lock()
            .await
            .insert(record.id, (project_id, record.clone()));
        Ok(())
    }

    async fn get_record(
        &self,
        project_id: Uuid,
        pipeline_id: Uuid,
        record_id: Uuid,
    ) -> StoreResult<Option<PipelineRecord>> {
        let records = self.records.lock().await;
        Ok(records
            .get(&record_id)
            .filter(|(owner, record)| *owner == project_id && record.pipeline_id == pipeline_id)
            .map(|(_, record)| record.clone()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use gantry_core::domain::event::LEASE_WINDOW_SECS;
    use gantry_core::domain::pipeline::{Pipeline, Project};
    use gantry_core::domain::record::PerformParams;
    use std::collections::HashSet;

    /// Clock that only moves when told to
    pub(crate) struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self(std::sync::Mutex::new(Utc::now())))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now = *now + by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    pub(crate) fn sample_event() -> Event {
        let pipeline = Pipeline::default();
        let record = gantry_core::domain::record::PipelineRecord::new(
            pipeline.id,
            PerformParams {
                reference: "master".to_string(),
                ..Default::default()
            },
            "manual",
        );
        Event::new(Project::default(), pipeline, record, Utc::now())
    }

    #[tokio::test]
    async fn test_next_event_is_fifo() {
        let clock = ManualClock::new();
        let store = MemoryEventStore::with_clock(clock.clone());

        let mut ids = Vec::new();
        for _ in 0..3 {
            let event = store.create_event(sample_event()).await.unwrap();
            ids.push(event.id);
            clock.advance(Duration::seconds(1));
        }

        for expected in ids {
            let claimed = store.next_event().await.unwrap().unwrap();
            assert_eq!(claimed.id, expected);
            assert_eq!(claimed.queue_status, QueueStatus::OutQueue);
        }
        assert!(store.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_reclaim() {
        let clock = ManualClock::new();
        let store = MemoryEventStore::with_clock(clock.clone());
        let event = store.create_event(sample_event()).await.unwrap();

        let claimed = store.next_event().await.unwrap().unwrap();
        assert_eq!(claimed.id, event.id);

        clock.advance(Duration::seconds(LEASE_WINDOW_SECS - 1));
        assert!(store.next_event().await.unwrap().is_none());

        // Exactly one lease window old is still held
        clock.advance(Duration::seconds(1));
        assert!(store.next_event().await.unwrap().is_none());

        clock.advance(Duration::seconds(1));
        let reclaimed = store.next_event().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, event.id);
    }

    #[tokio::test]
    async fn test_renew_lease_keeps_event_claimed() {
        let clock = ManualClock::new();
        let store = MemoryEventStore::with_clock(clock.clone());
        let event = store.create_event(sample_event()).await.unwrap();
        store.next_event().await.unwrap().unwrap();

        clock.advance(Duration::minutes(2));
        store.renew_lease(event.id).await.unwrap();
        clock.advance(Duration::minutes(2));

        assert!(store.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryEventStore::new());
        let mut created = HashSet::new();
        for _ in 0..5 {
            created.insert(store.create_event(sample_event()).await.unwrap().id);
        }

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.next_event().await.unwrap() }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(event) = handle.await.unwrap() {
                claimed.push(event.id);
            }
        }

        let unique: HashSet<_> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 5);
        assert_eq!(unique, created);
    }

    #[tokio::test]
    async fn test_reset_delays_eligibility() {
        let clock = ManualClock::new();
        let store = MemoryEventStore::with_clock(clock.clone());
        let event = store.create_event(sample_event()).await.unwrap();
        store.next_event().await.unwrap().unwrap();

        let reset = store.reset_event(event.id).await.unwrap();
        assert_eq!(reset.retry, 1);
        assert_eq!(reset.queue_status, QueueStatus::InQueue);
        assert!(store.next_event().await.unwrap().is_none());

        clock.advance(Duration::minutes(1));
        assert_eq!(store.next_event().await.unwrap().unwrap().id, event.id);
    }

    #[tokio::test]
    async fn test_missing_event_is_not_found() {
        let store = MemoryEventStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(store.get_event(id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete_event(id).await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.reset_event(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_record_archive_scoped_to_project_and_pipeline() {
        let store = MemoryRecordStore::new();
        let event = sample_event();
        store.save_record(event.project.id, &event.record).await.unwrap();

        let found = store
            .get_record(event.project.id, event.pipeline.id, event.record.id)
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, event.record.id);

        let other_pipeline = store
            .get_record(event.project.id, Uuid::new_v4(), event.record.id)
            .await
            .unwrap();
        assert!(other_pipeline.is_none());

        let other_project = store
            .get_record(Uuid::new_v4(), event.pipeline.id, event.record.id)
            .await
            .unwrap();
        assert!(other_project.is_none());
    }
}
