use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use pravah_common::{PravahError, StageName, Watermark};

use super::db_err;
use crate::traits::CursorStore;

pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn get(&self, stage: StageName) -> Result<Option<Watermark>, PravahError> {
        let row = sqlx::query_as::<_, (DateTime<Utc>, String)>(
            "SELECT watermark_at, watermark_id FROM stage_cursors WHERE stage = $1",
        )
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|(at, id)| Watermark::new(at, id)))
    }

    async fn set(
        &self,
        stage: StageName,
        watermark: &Watermark,
    ) -> Result<Watermark, PravahError> {
        // The WHERE clause turns a regressing write into a no-op.
        sqlx::query(
            r#"
            INSERT INTO stage_cursors (stage, watermark_at, watermark_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (stage) DO UPDATE
                SET watermark_at = EXCLUDED.watermark_at,
                    watermark_id = EXCLUDED.watermark_id,
                    updated_at = now()
                WHERE (stage_cursors.watermark_at, stage_cursors.watermark_id)
                    < (EXCLUDED.watermark_at, EXCLUDED.watermark_id)
            "#,
        )
        .bind(stage.as_str())
        .bind(watermark.at)
        .bind(&watermark.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let current = self.get(stage).await?;
        current.ok_or_else(|| PravahError::transient(format!("cursor for {stage} vanished after write")))
    }
}
