use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use pravah_common::{AckOutcome, Job, JobState, PravahError, Watermark};

use super::{count, db_err};
use crate::traits::JobStore;

/// Row from the `jobs` table. Correlation ids live in `job_dispatches` and `job_acks`.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    state: String,
    stage1_expected: i64,
    stage1_received: i64,
    stage2_sent: bool,
    stage2_ack: bool,
    stage2_attempts: i32,
    stage2_watermark_at: Option<DateTime<Utc>>,
    stage2_watermark_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

impl JobRow {
    fn into_job(
        self,
        dispatched: BTreeSet<String>,
        acked: BTreeSet<String>,
    ) -> Result<Job, PravahError> {
        let stage2_watermark = match (self.stage2_watermark_at, self.stage2_watermark_id) {
            (Some(at), Some(id)) => Some(Watermark::new(at, id)),
            _ => None,
        };
        Ok(Job {
            state: self.state.parse()?,
            job_id: self.job_id,
            stage1_expected: count(self.stage1_expected),
            stage1_received: count(self.stage1_received),
            stage2_sent: self.stage2_sent,
            stage2_ack: self.stage2_ack,
            dispatched_correlation_ids: dispatched,
            acked_correlation_ids: acked,
            stage2_attempts: u32::try_from(self.stage2_attempts).unwrap_or(0),
            stage2_watermark,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deadline: self.deadline,
        })
    }
}

async fn load(conn: &mut PgConnection, job_id: &str) -> Result<Option<Job>, PravahError> {
    let Some(row) = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
    else {
        return Ok(None);
    };

    let dispatched = correlation_ids(&mut *conn, "job_dispatches", job_id).await?;
    let acked = correlation_ids(&mut *conn, "job_acks", job_id).await?;
    row.into_job(dispatched, acked).map(Some)
}

async fn correlation_ids(
    conn: &mut PgConnection,
    table: &str,
    job_id: &str,
) -> Result<BTreeSet<String>, PravahError> {
    let ids: Vec<String> =
        sqlx::query_scalar(&format!("SELECT correlation_id FROM {table} WHERE job_id = $1"))
            .bind(job_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
    Ok(ids.into_iter().collect())
}

/// Lock the job row for the rest of the transaction and return its state.
async fn lock_state(conn: &mut PgConnection, job_id: &str) -> Result<JobState, PravahError> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
    state
        .ok_or_else(|| PravahError::UnknownJob(job_id.to_string()))?
        .parse()
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, PravahError> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        load(&mut *conn, job_id).await
    }

    async fn load_existing(&self, job_id: &str) -> Result<Job, PravahError> {
        self.load(job_id)
            .await?
            .ok_or_else(|| PravahError::UnknownJob(job_id.to_string()))
    }

    /// Explain why a guarded UPDATE touched no row.
    async fn rejected(&self, job_id: &str, to: JobState) -> PravahError {
        match self.load(job_id).await {
            Ok(Some(job)) => PravahError::IllegalTransition {
                job_id: job.job_id,
                from: job.state.to_string(),
                to: to.to_string(),
            },
            Ok(None) => PravahError::UnknownJob(job_id.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<(), PravahError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, state, created_at, updated_at, deadline)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&job.job_id)
        .bind(job.state.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.deadline)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let active = self.active().await?.map(|j| j.job_id);
                Err(PravahError::JobConflict(
                    active.unwrap_or_else(|| job.job_id.clone()),
                ))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, PravahError> {
        self.load(job_id).await
    }

    async fn active(&self) -> Result<Option<Job>, PravahError> {
        let id: Option<String> = sqlx::query_scalar(
            "SELECT job_id FROM jobs WHERE state NOT IN ('DONE', 'TIMED_OUT') LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match id {
            Some(id) => self.load(&id).await,
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        job_id: &str,
        from: JobState,
        to: JobState,
    ) -> Result<Job, PravahError> {
        if !from.can_transition_to(to) {
            return Err(PravahError::IllegalTransition {
                job_id: job_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let updated = sqlx::query(
            "UPDATE jobs SET state = $3, updated_at = now() WHERE job_id = $1 AND state = $2",
        )
        .bind(job_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(self.rejected(job_id, to).await);
        }
        self.load_existing(job_id).await
    }

    async fn record_stage1_dispatch(
        &self,
        job_id: &str,
        correlation_id: &str,
    ) -> Result<Job, PravahError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let state = lock_state(&mut *tx, job_id).await?;
        if state != JobState::DispatchingStage1 {
            return Err(PravahError::IllegalTransition {
                job_id: job_id.to_string(),
                from: state.to_string(),
                to: JobState::DispatchingStage1.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO job_dispatches (job_id, correlation_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(correlation_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let job = load(&mut *tx, job_id)
            .await?
            .ok_or_else(|| PravahError::UnknownJob(job_id.to_string()))?;
        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn withdraw_stage1_dispatch(
        &self,
        job_id: &str,
        correlation_id: &str,
    ) -> Result<Job, PravahError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let state = lock_state(&mut *tx, job_id).await?;
        if state != JobState::DispatchingStage1 {
            return Err(PravahError::IllegalTransition {
                job_id: job_id.to_string(),
                from: state.to_string(),
                to: JobState::DispatchingStage1.to_string(),
            });
        }

        sqlx::query("DELETE FROM job_dispatches WHERE job_id = $1 AND correlation_id = $2")
            .bind(job_id)
            .bind(correlation_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let unacked =
            sqlx::query("DELETE FROM job_acks WHERE job_id = $1 AND correlation_id = $2")
                .bind(job_id)
                .bind(correlation_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        if unacked.rows_affected() == 1 {
            sqlx::query(
                "UPDATE jobs SET stage1_received = stage1_received - 1, updated_at = now() WHERE job_id = $1",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let job = load(&mut *tx, job_id)
            .await?
            .ok_or_else(|| PravahError::UnknownJob(job_id.to_string()))?;
        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn finish_stage1_dispatch(&self, job_id: &str) -> Result<Job, PravahError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET stage1_expected = (
                    SELECT count(*) FROM job_dispatches WHERE job_dispatches.job_id = jobs.job_id
                ),
                state = 'AWAITING_STAGE1_ACKS',
                updated_at = now()
            WHERE job_id = $1 AND state = 'DISPATCHING_STAGE1'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobState::AwaitingStage1Acks).await);
        }
        self.load_existing(job_id).await
    }

    async fn record_stage1_ack(
        &self,
        job_id: &str,
        correlation_id: &str,
    ) -> Result<AckOutcome, PravahError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Row lock serializes acks and dispatch bookkeeping for the same job.
        let state = lock_state(&mut *tx, job_id).await?;

        let dispatched: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM job_dispatches WHERE job_id = $1 AND correlation_id = $2)",
        )
        .bind(job_id)
        .bind(correlation_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        if !dispatched {
            return Err(crate::not_dispatched(job_id, correlation_id));
        }

        let mut duplicate = true;
        if !state.is_terminal() {
            let inserted = sqlx::query(
                r#"
                INSERT INTO job_acks (job_id, correlation_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(job_id)
            .bind(correlation_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if inserted.rows_affected() == 1 {
                duplicate = false;
                sqlx::query(
                    "UPDATE jobs SET stage1_received = stage1_received + 1, updated_at = now() WHERE job_id = $1",
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        let job = load(&mut *tx, job_id)
            .await?
            .ok_or_else(|| PravahError::UnknownJob(job_id.to_string()))?;
        tx.commit().await.map_err(db_err)?;

        Ok(AckOutcome { duplicate, job })
    }

    async fn claim_stage2(&self, job_id: &str) -> Result<Option<Job>, PravahError> {
        let claimed = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'DISPATCHING_STAGE2', updated_at = now()
            WHERE job_id = $1
              AND state = 'AWAITING_STAGE1_ACKS'
              AND stage1_received = stage1_expected
              AND NOT stage2_sent
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if claimed.rows_affected() == 0 {
            // Distinguish "not yet / already claimed" from an unknown job.
            self.load_existing(job_id).await?;
            return Ok(None);
        }
        self.load(job_id).await
    }

    async fn mark_stage2_sent(
        &self,
        job_id: &str,
        pending: Option<&Watermark>,
    ) -> Result<Job, PravahError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET stage2_sent = TRUE,
                stage2_attempts = stage2_attempts + 1,
                stage2_watermark_at = $2,
                stage2_watermark_id = $3,
                state = 'AWAITING_STAGE2_ACK',
                updated_at = now()
            WHERE job_id = $1 AND state = 'DISPATCHING_STAGE2'
            "#,
        )
        .bind(job_id)
        .bind(pending.map(|w| w.at))
        .bind(pending.map(|w| w.id.as_str()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(self.rejected(job_id, JobState::AwaitingStage2Ack).await);
        }
        self.load_existing(job_id).await
    }

    async fn record_stage2_ack(&self, job_id: &str) -> Result<AckOutcome, PravahError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET stage2_ack = TRUE,
                state = CASE WHEN state = 'AWAITING_STAGE2_ACK' THEN 'DONE' ELSE state END,
                updated_at = now()
            WHERE job_id = $1
              AND NOT stage2_ack
              AND state NOT IN ('DONE', 'TIMED_OUT')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let job = self.load_existing(job_id).await?;
        Ok(AckOutcome {
            duplicate: updated.rows_affected() == 0,
            job,
        })
    }
}
