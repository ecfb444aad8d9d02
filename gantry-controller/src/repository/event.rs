//! Event Repository
//!
//! Postgres-backed event queue. The claim is a single
//! `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED LIMIT 1)`
//! statement, so concurrent workers never see the same event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::domain::event::{Event, QueueStatus, lease_window};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use super::{Clock, EventStore, StoreError, StoreResult, SystemClock};

const EVENT_COLUMNS: &str = "id, queue_status, in_time, out_time, retry, project, pipeline, record";

pub struct PgEventStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create_event(&self, mut event: Event) -> StoreResult<Event> {
        event.queue_status = QueueStatus::InQueue;
        event.in_time = self.clock.now();

        sqlx::query(
            r#"
            INSERT INTO events (id, queue_status, in_time, out_time, retry, project, pipeline, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.queue_status.as_str())
        .bind(event.in_time)
        .bind(event.out_time)
        .bind(event.retry as i32)
        .bind(to_json(&event.project)?)
        .bind(to_json(&event.pipeline)?)
        .bind(to_json(&event.record)?)
        .execute(&self.pool)
        .await?;

        Ok(event)
    }

    async fn get_event(&self, id: Uuid) -> StoreResult<Event> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM events WHERE id = $1",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn next_event(&self) -> StoreResult<Option<Event>> {
        let now = self.clock.now();
        let lease_expired_before = now - lease_window();

        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE events
            SET queue_status = 'out', out_time = $1
            WHERE id IN (
                SELECT id FROM events
                WHERE (queue_status = 'in' AND in_time <= $1)
                   OR (queue_status = 'out' AND (out_time IS NULL OR out_time < $2))
                ORDER BY in_time ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(now)
        .bind(lease_expired_before)
        .fetch_all(&self.pool)
        .await?;

        let mut rows = rows.into_iter();
        let Some(row) = rows.next() else {
            return Ok(None);
        };
        if rows.next().is_some() {
            return Err(StoreError::MultipleMatch(row.id));
        }

        row.try_into().map(Some)
    }

    async fn update_event(&self, event: &Event) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET queue_status = $2, in_time = $3, out_time = $4, retry = $5,
                project = $6, pipeline = $7, record = $8
            WHERE id = $1
            "#,
        )
        .bind(event.id)
        .bind(event.queue_status.as_str())
        .bind(event.in_time)
        .bind(event.out_time)
        .bind(event.retry as i32)
        .bind(to_json(&event.project)?)
        .bind(to_json(&event.pipeline)?)
        .bind(to_json(&event.record)?)
        .execute(&self.pool)
        .await?;

        check_single(event.id, result.rows_affected())
    }

    async fn reset_event(&self, id: Uuid) -> StoreResult<Event> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {} FROM events WHERE id = $1 FOR UPDATE",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut event: Event = row.ok_or(StoreError::NotFound(id))?.try_into()?;
        event.reset(self.clock.now());

        let result = sqlx::query(
            "UPDATE events SET retry = $2, queue_status = $3, in_time = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(event.retry as i32)
        .bind(event.queue_status.as_str())
        .bind(event.in_time)
        .execute(&mut *tx)
        .await?;

        check_single(id, result.rows_affected())?;
        tx.commit().await?;

        Ok(event)
    }

    async fn renew_lease(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE events SET queue_status = 'out', out_time = $2 WHERE id = $1")
            .bind(id)
            .bind(self.clock.now())
            .execute(&self.pool)
            .await?;

        check_single(id, result.rows_affected())
    }

    async fn delete_event(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        check_single(id, result.rows_affected())
    }
}

fn check_single(id: Uuid, rows_affected: u64) -> StoreResult<()> {
    match rows_affected {
        0 => Err(StoreError::NotFound(id)),
        1 => Ok(()),
        _ => Err(StoreError::MultipleMatch(id)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    queue_status: String,
    in_time: DateTime<Utc>,
    out_time: Option<DateTime<Utc>>,
    retry: i32,
    project: serde_json::Value,
    pipeline: serde_json::Value,
    record: serde_json::Value,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let queue_status = QueueStatus::parse(&row.queue_status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown queue status '{}'", row.queue_status))
        })?;

        Ok(Event {
            id: row.id,
            queue_status,
            in_time: row.in_time,
            out_time: row.out_time,
            retry: row.retry.max(0) as u32,
            project: from_json(row.project)?,
            pipeline: from_json(row.pipeline)?,
            record: from_json(row.record)?,
        })
    }
}
