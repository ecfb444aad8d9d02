//! Record Repository
//!
//! Archive of pipeline records. A record is written on every status push and
//! stays after its event is resolved.

use async_trait::async_trait;
use gantry_core::domain::record::PipelineRecord;
use sqlx::PgPool;
use uuid::Uuid;

use super::{RecordStore, StoreError, StoreResult};

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn save_record(&self, project_id: Uuid, record: &PipelineRecord) -> StoreResult<()> {
        let snapshot =
            serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_records (id, project_id, pipeline_id, status, record, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, record = EXCLUDED.record, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.id)
        .bind(project_id)
        .bind(record.pipeline_id)
        .bind(record.status.to_string())
        .bind(snapshot)
        .bind(chrono::Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_record(
        &self,
        project_id: Uuid,
        pipeline_id: Uuid,
        record_id: Uuid,
    ) -> StoreResult<Option<PipelineRecord>> {
        let snapshot: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT record FROM pipeline_records WHERE id = $1 AND pipeline_id = $2 AND project_id = $3",
        )
        .bind(record_id)
        .bind(pipeline_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        snapshot
            .map(|value| {
                serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .transpose()
    }
}
