//! Append-only failure log.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::Page;

use super::error::StoreError;
use super::models::{NewPipelineFailure, PipelineFailure};

/// Append-only record of terminal and retry-exhausted failures.
#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn record(&self, failure: NewPipelineFailure) -> Result<PipelineFailure, StoreError>;

    async fn list(
        &self,
        tenant_id: Uuid,
        page: Page,
    ) -> Result<Vec<PipelineFailure>, StoreError>;

    async fn list_for_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<PipelineFailure>, StoreError>;
}

pub struct PgFailureLog {
    pool: PgPool,
}

impl PgFailureLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailureLog for PgFailureLog {
    async fn record(&self, failure: NewPipelineFailure) -> Result<PipelineFailure, StoreError> {
        let recorded = sqlx::query_as::<_, PipelineFailure>(
            r#"
            INSERT INTO pipeline_failures (
                id, tenant_id, job_id, campaign_id, contact_id,
                error_message, last_status, retry_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(failure.tenant_id)
        .bind(failure.job_id)
        .bind(failure.campaign_id)
        .bind(failure.contact_id)
        .bind(&failure.error_message)
        .bind(failure.last_status)
        .bind(failure.retry_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(recorded)
    }

    async fn list(
        &self,
        tenant_id: Uuid,
        page: Page,
    ) -> Result<Vec<PipelineFailure>, StoreError> {
        let failures = sqlx::query_as::<_, PipelineFailure>(
            r#"
            SELECT * FROM pipeline_failures
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(tenant_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(failures)
    }

    async fn list_for_job(
        &self,
        tenant_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<PipelineFailure>, StoreError> {
        let failures = sqlx::query_as::<_, PipelineFailure>(
            r#"
            SELECT * FROM pipeline_failures
            WHERE tenant_id = $1 AND job_id = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id)
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(failures)
    }
}
