use async_trait::async_trait;
use pgvector::Vector;
use sqlx::PgPool;

use pravah_common::{Partition, PravahError};

use super::db_err;
use crate::traits::{IndexDocument, ScoredHit, SearchIndex};

#[derive(Debug, sqlx::FromRow)]
struct HitRow {
    record_id: String,
    parent_id: Option<String>,
    text: String,
    score: f64,
}

impl From<HitRow> for ScoredHit {
    fn from(row: HitRow) -> Self {
        ScoredHit {
            record_id: row.record_id,
            parent_id: row.parent_id,
            text: row.text,
            score: row.score,
        }
    }
}

// `<=>` is cosine distance (1 - cos), so (1 + cos) / 2 = 1 - distance / 2.
const VECTOR_QUERY: &str = r#"
    SELECT record_id, parent_id, text, (1.0 - (embedding <=> $2) / 2.0)::float8 AS score
    FROM search_documents
    WHERE kb_id = $1 AND embedding IS NOT NULL
    ORDER BY embedding <=> $2
    LIMIT $3
"#;

// Terms are OR-ed; the score counts distinct query lexemes present in the
// document, ties broken by cover density.
const LEXICAL_QUERY: &str = r#"
    WITH q AS (
        SELECT replace(plainto_tsquery('english', $2)::text, '&', '|')::tsquery AS query,
               tsvector_to_array(to_tsvector('english', $2)) AS lexemes
    )
    SELECT d.record_id, d.parent_id, d.text,
           (SELECT count(*) FROM unnest(tsvector_to_array(d.tsv)) AS lex
             WHERE lex = ANY(q.lexemes))::float8 AS score
    FROM search_documents d, q
    WHERE d.kb_id = $1 AND d.tsv @@ q.query
    ORDER BY score DESC, ts_rank_cd(d.tsv, q.query) DESC, d.record_id
    LIMIT $3
"#;

pub struct PgSearchIndex {
    pool: PgPool,
}

impl PgSearchIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a partition so `has_partition` reports it before the first write.
    pub async fn ensure_partition(&self, partition: &Partition) -> Result<(), PravahError> {
        sqlx::query("INSERT INTO search_partitions (kb_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(&partition.kb_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for PgSearchIndex {
    async fn vector_query(
        &self,
        partition: &Partition,
        vector: &[f32],
        limit: usize,
        exact: bool,
    ) -> Result<Vec<ScoredHit>, PravahError> {
        let query_vec = Vector::from(vector.to_vec());

        let rows = if exact {
            // Disabling index scans forces a sequential, exact KNN scan.
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query("SET LOCAL enable_indexscan = off")
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            let rows = sqlx::query_as::<_, HitRow>(VECTOR_QUERY)
                .bind(&partition.kb_id)
                .bind(&query_vec)
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            rows
        } else {
            sqlx::query_as::<_, HitRow>(VECTOR_QUERY)
                .bind(&partition.kb_id)
                .bind(&query_vec)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
        };

        Ok(rows.into_iter().map(ScoredHit::from).collect())
    }

    async fn lexical_query(
        &self,
        partition: &Partition,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredHit>, PravahError> {
        let rows = sqlx::query_as::<_, HitRow>(LEXICAL_QUERY)
            .bind(&partition.kb_id)
            .bind(query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(ScoredHit::from).collect())
    }

    async fn upsert(&self, partition: &Partition, doc: &IndexDocument) -> Result<(), PravahError> {
        let embedding = (!doc.embedding.is_empty()).then(|| Vector::from(doc.embedding.clone()));

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("INSERT INTO search_partitions (kb_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(&partition.kb_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO search_documents (kb_id, record_id, parent_id, text, embedding)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (kb_id, record_id) DO UPDATE
                SET parent_id = EXCLUDED.parent_id,
                    text = EXCLUDED.text,
                    embedding = EXCLUDED.embedding,
                    updated_at = now()
            "#,
        )
        .bind(&partition.kb_id)
        .bind(&doc.record_id)
        .bind(&doc.parent_id)
        .bind(&doc.text)
        .bind(embedding)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn has_partition(&self, partition: &Partition) -> Result<bool, PravahError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM search_partitions WHERE kb_id = $1)")
            .bind(&partition.kb_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }
}
