//! Durable storage for pipeline jobs.
//!
//! All writes funnel through [`JobStore::transition`], which locks the row,
//! validates the edge against the state machine, and persists the computed
//! row image. `acquire_next_pending` claims work with `FOR UPDATE SKIP
//! LOCKED` so many pollers can run concurrently without blocking each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::Page;

use super::error::StoreError;
use super::models::{Channel, JobStatus, PipelineJob, SkipReason};
use super::state::{self, TransitionFields};

/// Filters for job listings. All fields are optional and combined with AND.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub campaign_id: Option<Uuid>,
    pub campaign_run_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub channel: Option<Channel>,
}

/// Job counts bucketed by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub queued: i64,
    pub processing: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
    pub retrying: i64,
    pub dead: i64,
    pub skipped: i64,
}

impl StatusCounts {
    pub fn from_rows(rows: impl IntoIterator<Item = (JobStatus, i64)>) -> Self {
        let mut counts = Self::default();
        for (status, count) in rows {
            *counts.slot_mut(status) += count;
        }
        counts
    }

    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Queued => self.queued,
            JobStatus::Processing => self.processing,
            JobStatus::Sent => self.sent,
            JobStatus::Delivered => self.delivered,
            JobStatus::Failed => self.failed,
            JobStatus::Retrying => self.retrying,
            JobStatus::Dead => self.dead,
            JobStatus::Skipped => self.skipped,
        }
    }

    fn slot_mut(&mut self, status: JobStatus) -> &mut i64 {
        match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Queued => &mut self.queued,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Sent => &mut self.sent,
            JobStatus::Delivered => &mut self.delivered,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Dead => &mut self.dead,
            JobStatus::Skipped => &mut self.skipped,
        }
    }
}

/// Storage interface for pipeline jobs.
///
/// The `mark_*` helpers are thin wrappers that delegate to `transition`, so
/// implementations only supply the primitive operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a batch of jobs, all-or-nothing. Jobs are created in `Pending`.
    async fn create_bulk(&self, jobs: Vec<PipelineJob>) -> Result<Vec<PipelineJob>, StoreError>;

    /// Tenant-scoped lookup.
    async fn find_by_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PipelineJob>, StoreError>;

    /// Internal lookup by primary key (worker and broker paths).
    async fn get(&self, id: Uuid) -> Result<PipelineJob, StoreError>;

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<PipelineJob>, StoreError>;

    /// List jobs for a tenant, stable-ordered by `created_at`.
    async fn find_jobs(
        &self,
        tenant_id: Uuid,
        filter: &JobFilter,
        page: Page,
    ) -> Result<Vec<PipelineJob>, StoreError>;

    /// Atomically claim the oldest ready job (`Pending`, or `Retrying` past
    /// its backoff) and move it to `Processing` in the same transaction.
    /// Contended rows are skipped so concurrent pollers never block.
    async fn acquire_next_pending(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<PipelineJob>, StoreError>;

    /// The single mutation entry point: validate the edge, stamp the
    /// per-state timestamp, merge `fields`, persist under a row lock.
    async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<PipelineJob, StoreError>;

    /// Bulk `Pending -> Queued` flip used by the producer hand-off. Only
    /// rows still in `Pending` are touched; returns how many moved.
    async fn mark_queued_bulk(&self, job_ids: &[Uuid]) -> Result<u64, StoreError>;

    /// Jobs eligible for the retry controller: `Failed`/`Retrying`, a
    /// scheduled `next_attempt_at` that has passed, and retries not above
    /// `max_retries`.
    async fn jobs_due_for_retry(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<PipelineJob>, StoreError>;

    /// `Processing` rows whose claim is older than `cutoff` (crashed
    /// workers, reaped by the retry controller).
    async fn stuck_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PipelineJob>, StoreError>;

    /// Counts by status, optionally scoped to one tenant.
    async fn count_by_status(&self, tenant_id: Option<Uuid>) -> Result<StatusCounts, StoreError>;

    /// Counts by status for one campaign run (stats recovery path).
    async fn run_status_counts(&self, campaign_run_id: Uuid) -> Result<StatusCounts, StoreError>;

    /// Counts by status for one campaign (dashboard stats).
    async fn campaign_status_counts(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<StatusCounts, StoreError>;

    /// Contact ids that already have a job in the given run (duplicate-send
    /// detection for idempotent re-dispatch).
    async fn contact_ids_in_run(&self, campaign_run_id: Uuid) -> Result<Vec<Uuid>, StoreError>;

    // ------------------------------------------------------------------
    // Convenience wrappers, all delegating to `transition`.
    // ------------------------------------------------------------------

    async fn mark_sent(
        &self,
        job_id: Uuid,
        provider_message_id: &str,
    ) -> Result<PipelineJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Sent,
            TransitionFields {
                provider_message_id: Some(provider_message_id.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<PipelineJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Failed,
            TransitionFields {
                error_message: Some(error.to_string()),
                next_attempt_at,
                ..Default::default()
            },
        )
        .await
    }

    async fn mark_skipped(
        &self,
        job_id: Uuid,
        reason: SkipReason,
        error: &str,
    ) -> Result<PipelineJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Skipped,
            TransitionFields {
                skip_reason: Some(reason),
                error_message: Some(error.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    async fn mark_dead(
        &self,
        job_id: Uuid,
        error: &str,
        retry_count: Option<i32>,
    ) -> Result<PipelineJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Dead,
            TransitionFields {
                error_message: Some(error.to_string()),
                retry_count,
                ..Default::default()
            },
        )
        .await
    }

    async fn mark_delivered(&self, job_id: Uuid) -> Result<PipelineJob, StoreError> {
        self.transition(job_id, JobStatus::Delivered, TransitionFields::default())
            .await
    }

    async fn schedule_retry(
        &self,
        job_id: Uuid,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<PipelineJob, StoreError> {
        self.transition(
            job_id,
            JobStatus::Retrying,
            TransitionFields {
                retry_count: Some(retry_count),
                next_attempt_at: Some(next_attempt_at),
                ..Default::default()
            },
        )
        .await
    }
}

/// PostgreSQL-backed job store.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_bulk(&self, jobs: Vec<PipelineJob>) -> Result<Vec<PipelineJob>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(jobs.len());

        for job in jobs {
            let inserted = sqlx::query_as::<_, PipelineJob>(
                r#"
                INSERT INTO pipeline_jobs (
                    id, tenant_id, campaign_id, campaign_run_id, contact_id,
                    template_version_id, channel, payload, status, retry_count,
                    next_attempt_at, error_message, skip_reason,
                    provider_message_id, correlation_id, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW(), NOW())
                RETURNING *
                "#,
            )
            .bind(job.id)
            .bind(job.tenant_id)
            .bind(job.campaign_id)
            .bind(job.campaign_run_id)
            .bind(job.contact_id)
            .bind(job.template_version_id)
            .bind(job.channel)
            .bind(&job.payload)
            .bind(job.status)
            .bind(job.retry_count)
            .bind(job.next_attempt_at)
            .bind(&job.error_message)
            .bind(job.skip_reason)
            .bind(&job.provider_message_id)
            .bind(&job.correlation_id)
            .fetch_one(&mut *tx)
            .await?;
            created.push(inserted);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn find_by_id(
        &self,
        tenant_id: Uuid,
        id: Uuid,
    ) -> Result<Option<PipelineJob>, StoreError> {
        let job = sqlx::query_as::<_, PipelineJob>(
            "SELECT * FROM pipeline_jobs WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<PipelineJob, StoreError> {
        let job = sqlx::query_as::<_, PipelineJob>("SELECT * FROM pipeline_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        job.ok_or(StoreError::JobNotFound(id))
    }

    async fn find_by_provider_message_id(
        &self,
        provider_message_id: &str,
    ) -> Result<Option<PipelineJob>, StoreError> {
        let job = sqlx::query_as::<_, PipelineJob>(
            "SELECT * FROM pipeline_jobs WHERE provider_message_id = $1",
        )
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn find_jobs(
        &self,
        tenant_id: Uuid,
        filter: &JobFilter,
        page: Page,
    ) -> Result<Vec<PipelineJob>, StoreError> {
        let jobs = sqlx::query_as::<_, PipelineJob>(
            r#"
            SELECT * FROM pipeline_jobs
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR campaign_id = $2)
              AND ($3::uuid IS NULL OR campaign_run_id = $3)
              AND ($4::uuid IS NULL OR contact_id = $4)
              AND ($5::text IS NULL OR status = $5)
              AND ($6::text IS NULL OR channel = $6)
            ORDER BY created_at ASC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(tenant_id)
        .bind(filter.campaign_id)
        .bind(filter.campaign_run_id)
        .bind(filter.contact_id)
        .bind(filter.status)
        .bind(filter.channel)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn acquire_next_pending(
        &self,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<PipelineJob>, StoreError> {
        let job = sqlx::query_as::<_, PipelineJob>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM pipeline_jobs
                WHERE status IN ('pending', 'retrying')
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                  AND ($1::uuid IS NULL OR tenant_id = $1)
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE pipeline_jobs
            SET status = 'processing',
                processing_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn transition(
        &self,
        job_id: Uuid,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<PipelineJob, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_as::<_, PipelineJob>(
            "SELECT * FROM pipeline_jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let next = state::apply(&current, to, fields, Utc::now())?;

        let updated = sqlx::query_as::<_, PipelineJob>(
            r#"
            UPDATE pipeline_jobs
            SET status = $2,
                retry_count = $3,
                next_attempt_at = $4,
                error_message = $5,
                skip_reason = $6,
                provider_message_id = $7,
                queued_at = $8,
                processing_at = $9,
                sent_at = $10,
                delivered_at = $11,
                failed_at = $12,
                skipped_at = $13,
                updated_at = $14
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(next.id)
        .bind(next.status)
        .bind(next.retry_count)
        .bind(next.next_attempt_at)
        .bind(&next.error_message)
        .bind(next.skip_reason)
        .bind(&next.provider_message_id)
        .bind(next.queued_at)
        .bind(next.processing_at)
        .bind(next.sent_at)
        .bind(next.delivered_at)
        .bind(next.failed_at)
        .bind(next.skipped_at)
        .bind(next.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn mark_queued_bulk(&self, job_ids: &[Uuid]) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'queued',
                queued_at = NOW(),
                updated_at = NOW()
            WHERE id = ANY($1) AND status = 'pending'
            "#,
        )
        .bind(job_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn jobs_due_for_retry(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<PipelineJob>, StoreError> {
        let jobs = sqlx::query_as::<_, PipelineJob>(
            r#"
            SELECT * FROM pipeline_jobs
            WHERE status IN ('failed', 'retrying')
              AND retry_count <= $1
              AND next_attempt_at IS NOT NULL
              AND next_attempt_at <= NOW()
            ORDER BY next_attempt_at ASC
            LIMIT $2
            "#,
        )
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn stuck_processing(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PipelineJob>, StoreError> {
        let jobs = sqlx::query_as::<_, PipelineJob>(
            r#"
            SELECT * FROM pipeline_jobs
            WHERE status = 'processing'
              AND processing_at IS NOT NULL
              AND processing_at < $1
            ORDER BY processing_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn count_by_status(&self, tenant_id: Option<Uuid>) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM pipeline_jobs
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY status
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(StatusCounts::from_rows(rows))
    }

    async fn run_status_counts(&self, campaign_run_id: Uuid) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM pipeline_jobs
            WHERE campaign_run_id = $1
            GROUP BY status
            "#,
        )
        .bind(campaign_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(StatusCounts::from_rows(rows))
    }

    async fn campaign_status_counts(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM pipeline_jobs
            WHERE tenant_id = $1 AND campaign_id = $2
            GROUP BY status
            "#,
        )
        .bind(tenant_id)
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(StatusCounts::from_rows(rows))
    }

    async fn contact_ids_in_run(&self, campaign_run_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT contact_id FROM pipeline_jobs WHERE campaign_run_id = $1",
        )
        .bind(campaign_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_counts_fold_rows() {
        let counts = StatusCounts::from_rows([
            (JobStatus::Sent, 3),
            (JobStatus::Skipped, 2),
            (JobStatus::Dead, 1),
        ]);
        assert_eq!(counts.sent, 3);
        assert_eq!(counts.skipped, 2);
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.get(JobStatus::Sent), 3);
    }
}
