use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::PgPool;
use tracing::warn;

use pravah_common::{CandidateRecord, CanonicalRecord, PravahError, Watermark};

use super::{count, db_err};
use crate::traits::{BatchReport, CanonicalStore, SourceStore};

// ---------------------------------------------------------------------------
// Scouted items
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ScoutedRow {
    source_id: String,
    content: String,
    location: String,
    source: String,
    engagement_count: i64,
    fetched_at: DateTime<Utc>,
}

impl TryFrom<ScoutedRow> for CandidateRecord {
    type Error = PravahError;

    fn try_from(row: ScoutedRow) -> Result<Self, Self::Error> {
        Ok(CandidateRecord {
            source: row.source.parse()?,
            source_id: row.source_id,
            content: row.content,
            location: row.location,
            engagement_count: count(row.engagement_count),
            fetched_at: row.fetched_at,
        })
    }
}

pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert(&self, item: &CandidateRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO scouted_items
                (source_id, content, location, source, engagement_count, fetched_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (source_id) DO UPDATE
                SET content = EXCLUDED.content,
                    location = EXCLUDED.location,
                    source = EXCLUDED.source,
                    engagement_count = EXCLUDED.engagement_count,
                    fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(&item.source_id)
        .bind(&item.content)
        .bind(&item.location)
        .bind(item.source.to_string())
        .bind(item.engagement_count as i64)
        .bind(item.fetched_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn page_after(
        &self,
        after: Option<&Watermark>,
        limit: usize,
    ) -> Result<Vec<CandidateRecord>, PravahError> {
        let rows = sqlx::query_as::<_, ScoutedRow>(
            r#"
            SELECT source_id, content, location, source, engagement_count, fetched_at
            FROM scouted_items
            WHERE $1::timestamptz IS NULL OR (fetched_at, source_id) > ($1, $2::text)
            ORDER BY fetched_at, source_id
            LIMIT $3
            "#,
        )
        .bind(after.map(|w| w.at))
        .bind(after.map(|w| w.id.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(CandidateRecord::try_from).collect()
    }

    async fn write_batch(&self, items: &[CandidateRecord]) -> Result<BatchReport, PravahError> {
        let mut report = BatchReport::default();
        for item in items {
            match self.upsert(item).await {
                Ok(()) => report.written.push(item.source_id.clone()),
                Err(e) => {
                    warn!(source_id = %item.source_id, error = %e, "Failed to write scouted item");
                    report.failed.push((item.source_id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Canonical records
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct CanonicalRow {
    unique_id: String,
    category: String,
    location: String,
    text: String,
    embedding: Option<Vector>,
    severity: String,
    priority_score: f64,
    engagement_count: i64,
    source_ids: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CanonicalRow> for CanonicalRecord {
    type Error = PravahError;

    fn try_from(row: CanonicalRow) -> Result<Self, Self::Error> {
        Ok(CanonicalRecord {
            category: row.category.parse()?,
            severity: row.severity.parse()?,
            unique_id: row.unique_id,
            location: row.location,
            text: row.text,
            embedding: row.embedding.map(|v| v.to_vec()).unwrap_or_default(),
            priority_score: row.priority_score,
            engagement_count: count(row.engagement_count),
            source_ids: row.source_ids.into_iter().collect::<BTreeSet<_>>(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Canonical records in one table: `canonical_records` for stage 1 output,
/// `synthesized_events` for stage 2 output. Both tables share a shape.
pub struct PgCanonicalStore {
    pool: PgPool,
    table: &'static str,
}

impl PgCanonicalStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: "canonical_records",
        }
    }

    pub fn synthesized(pool: PgPool) -> Self {
        Self {
            pool,
            table: "synthesized_events",
        }
    }

    async fn write(&self, record: &CanonicalRecord) -> Result<(), sqlx::Error> {
        let embedding =
            (!record.embedding.is_empty()).then(|| Vector::from(record.embedding.clone()));
        let source_ids: Vec<String> = record.source_ids.iter().cloned().collect();

        sqlx::query(&format!(
            r#"
            INSERT INTO {}
                (unique_id, category, location, text, embedding, severity,
                 priority_score, engagement_count, source_ids, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (unique_id) DO UPDATE
                SET category = EXCLUDED.category,
                    location = EXCLUDED.location,
                    text = EXCLUDED.text,
                    embedding = EXCLUDED.embedding,
                    severity = EXCLUDED.severity,
                    priority_score = EXCLUDED.priority_score,
                    engagement_count = EXCLUDED.engagement_count,
                    source_ids = EXCLUDED.source_ids,
                    updated_at = EXCLUDED.updated_at
            "#,
            self.table
        ))
        .bind(&record.unique_id)
        .bind(record.category.to_string())
        .bind(&record.location)
        .bind(&record.text)
        .bind(embedding)
        .bind(record.severity.to_string())
        .bind(record.priority_score)
        .bind(record.engagement_count as i64)
        .bind(source_ids)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for PgCanonicalStore {
    async fn get(&self, unique_id: &str) -> Result<Option<CanonicalRecord>, PravahError> {
        let row = sqlx::query_as::<_, CanonicalRow>(&format!(
            "SELECT * FROM {} WHERE unique_id = $1",
            self.table
        ))
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(CanonicalRecord::try_from).transpose()
    }

    async fn find_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Option<CanonicalRecord>, PravahError> {
        let row = sqlx::query_as::<_, CanonicalRow>(&format!(
            "SELECT * FROM {} WHERE source_ids @> ARRAY[$1::text] ORDER BY unique_id LIMIT 1",
            self.table
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(CanonicalRecord::try_from).transpose()
    }

    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), PravahError> {
        self.write(record).await.map_err(db_err)
    }

    async fn page_after(
        &self,
        after: Option<&Watermark>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, PravahError> {
        let rows = sqlx::query_as::<_, CanonicalRow>(&format!(
            r#"
            SELECT * FROM {}
            WHERE $1::timestamptz IS NULL OR (updated_at, unique_id) > ($1, $2::text)
            ORDER BY updated_at, unique_id
            LIMIT $3
            "#,
            self.table
        ))
        .bind(after.map(|w| w.at))
        .bind(after.map(|w| w.id.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(CanonicalRecord::try_from).collect()
    }

    async fn write_batch(&self, records: &[CanonicalRecord]) -> Result<BatchReport, PravahError> {
        let mut report = BatchReport::default();
        for record in records {
            match self.write(record).await {
                Ok(()) => report.written.push(record.unique_id.clone()),
                Err(e) => {
                    warn!(unique_id = %record.unique_id, error = %e, "Failed to write canonical record");
                    report.failed.push((record.unique_id.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }
}
