//! Per-run counter aggregation and run finalization.
//!
//! Counters are advanced with single-statement atomic updates (never
//! read-modify-write) so they stay correct under concurrent workers. After
//! every increment the aggregator checks whether the run is fully processed
//! and, exactly once, finalizes it and mirrors the status onto the parent
//! campaign.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::domains::pipeline::error::StoreError;
use crate::domains::pipeline::events::PipelineEvent;
use crate::domains::pipeline::store::{JobStore, StatusCounts};
use crate::kernel::events::EventPublisher;

use super::models::{CampaignRun, CampaignStatus, RunStatus};

/// Which run counter an increment advances. Every increment also advances
/// `processed_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Sent,
    Failed,
    Skipped,
}

/// Counter values produced by a recount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
    pub pending: i64,
}

impl RunCounts {
    /// Fold job status counts into run counters: sent covers delivered,
    /// failed covers dead, and everything not yet settled counts as pending.
    pub fn from_status_counts(counts: &StatusCounts) -> Self {
        Self {
            sent: counts.sent + counts.delivered,
            failed: counts.failed + counts.dead,
            skipped: counts.skipped,
            pending: counts.pending + counts.queued + counts.processing + counts.retrying,
        }
    }

    pub fn processed(&self) -> i64 {
        self.sent + self.failed + self.skipped
    }
}

/// Storage interface for run counters and finalization.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn find(&self, run_id: Uuid) -> Result<Option<CampaignRun>, StoreError>;

    /// Atomically advance one counter plus `processed_count`, returning the
    /// updated row.
    async fn increment(&self, run_id: Uuid, counter: Counter) -> Result<CampaignRun, StoreError>;

    /// Compare-and-set finalization: only a `running` run is moved to the
    /// terminal status, and the parent campaign is mirrored in the same
    /// transaction. Returns whether this call performed the finalization.
    async fn finalize(&self, run_id: Uuid, status: RunStatus) -> Result<bool, StoreError>;

    /// Overwrite counters from a recount (recovery path).
    async fn write_counts(
        &self,
        run_id: Uuid,
        counts: RunCounts,
    ) -> Result<CampaignRun, StoreError>;
}

pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn find(&self, run_id: Uuid) -> Result<Option<CampaignRun>, StoreError> {
        let run =
            sqlx::query_as::<_, CampaignRun>("SELECT * FROM campaign_runs WHERE id = $1")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(run)
    }

    async fn increment(&self, run_id: Uuid, counter: Counter) -> Result<CampaignRun, StoreError> {
        let sql = match counter {
            Counter::Sent => {
                r#"
                UPDATE campaign_runs
                SET sent_count = sent_count + 1,
                    processed_count = processed_count + 1,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#
            }
            Counter::Failed => {
                r#"
                UPDATE campaign_runs
                SET failed_count = failed_count + 1,
                    processed_count = processed_count + 1,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#
            }
            Counter::Skipped => {
                r#"
                UPDATE campaign_runs
                SET skipped_count = skipped_count + 1,
                    processed_count = processed_count + 1,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#
            }
        };

        let run = sqlx::query_as::<_, CampaignRun>(sql)
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(run)
    }

    async fn finalize(&self, run_id: Uuid, status: RunStatus) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE campaign_runs
            SET status = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(run_id)
        .bind(status)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Already finalized by a concurrent increment.
            return Ok(false);
        }

        let campaign_status = match status {
            RunStatus::Failed => CampaignStatus::Failed,
            _ => CampaignStatus::Completed,
        };
        sqlx::query(
            r#"
            UPDATE campaigns
            SET status = $2,
                updated_at = NOW()
            WHERE id = (SELECT campaign_id FROM campaign_runs WHERE id = $1)
            "#,
        )
        .bind(run_id)
        .bind(campaign_status)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn write_counts(
        &self,
        run_id: Uuid,
        counts: RunCounts,
    ) -> Result<CampaignRun, StoreError> {
        let run = sqlx::query_as::<_, CampaignRun>(
            r#"
            UPDATE campaign_runs
            SET sent_count = $2,
                failed_count = $3,
                skipped_count = $4,
                processed_count = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(run_id)
        .bind(counts.sent as i32)
        .bind(counts.failed as i32)
        .bind(counts.skipped as i32)
        .bind(counts.processed() as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(run)
    }
}

/// Aggregates job outcomes into run counters and finalizes completed runs.
#[derive(Clone)]
pub struct StatsAggregator {
    runs: Arc<dyn RunStore>,
    jobs: Arc<dyn JobStore>,
    events: EventPublisher,
}

impl StatsAggregator {
    pub fn new(runs: Arc<dyn RunStore>, jobs: Arc<dyn JobStore>, events: EventPublisher) -> Self {
        Self { runs, jobs, events }
    }

    pub async fn increment_sent(&self, run_id: Uuid, correlation_id: &str) -> Result<(), StoreError> {
        self.record(run_id, Counter::Sent, correlation_id).await
    }

    pub async fn increment_failed(
        &self,
        run_id: Uuid,
        correlation_id: &str,
    ) -> Result<(), StoreError> {
        self.record(run_id, Counter::Failed, correlation_id).await
    }

    pub async fn increment_skipped(
        &self,
        run_id: Uuid,
        correlation_id: &str,
    ) -> Result<(), StoreError> {
        self.record(run_id, Counter::Skipped, correlation_id).await
    }

    async fn record(
        &self,
        run_id: Uuid,
        counter: Counter,
        correlation_id: &str,
    ) -> Result<(), StoreError> {
        let run = self.runs.increment(run_id, counter).await?;
        self.maybe_finalize(&run, correlation_id).await
    }

    /// Finalize the run when every recipient is accounted for. The
    /// compare-and-set in the store makes repeated and late increments
    /// record without re-emitting `campaign_run.completed`.
    async fn maybe_finalize(
        &self,
        run: &CampaignRun,
        correlation_id: &str,
    ) -> Result<(), StoreError> {
        if !run.ready_to_finalize() {
            return Ok(());
        }

        let status = run.final_status();
        if self.runs.finalize(run.id, status).await? {
            tracing::info!(
                campaign_run_id = %run.id,
                campaign_id = %run.campaign_id,
                status = %status,
                sent = run.sent_count,
                failed = run.failed_count,
                skipped = run.skipped_count,
                "campaign run finalized"
            );
            self.events
                .publish(
                    PipelineEvent::CampaignRunCompleted {
                        campaign_run_id: run.id,
                        campaign_id: run.campaign_id,
                        status: status.to_string(),
                        total_recipients: run.total_recipients,
                        sent_count: run.sent_count,
                        failed_count: run.failed_count,
                        skipped_count: run.skipped_count,
                    }
                    .outbound(run.tenant_id, correlation_id),
                )
                .await;
        }
        Ok(())
    }

    /// Recount jobs by status and overwrite the run counters. This is the
    /// source of truth if the incremental counters ever drift.
    pub async fn recalculate_stats(&self, run_id: Uuid) -> Result<CampaignRun, StoreError> {
        let counts = self.jobs.run_status_counts(run_id).await?;
        let run_counts = RunCounts::from_status_counts(&counts);
        let run = self.runs.write_counts(run_id, run_counts).await?;
        tracing::info!(
            campaign_run_id = %run_id,
            sent = run_counts.sent,
            failed = run_counts.failed,
            skipped = run_counts.skipped,
            pending = run_counts.pending,
            "recalculated run stats"
        );
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recount_folds_statuses_into_run_counters() {
        let counts = StatusCounts::from_rows([
            (crate::domains::pipeline::models::JobStatus::Sent, 2),
            (crate::domains::pipeline::models::JobStatus::Delivered, 3),
            (crate::domains::pipeline::models::JobStatus::Failed, 1),
            (crate::domains::pipeline::models::JobStatus::Dead, 1),
            (crate::domains::pipeline::models::JobStatus::Skipped, 4),
            (crate::domains::pipeline::models::JobStatus::Pending, 1),
            (crate::domains::pipeline::models::JobStatus::Queued, 1),
            (crate::domains::pipeline::models::JobStatus::Processing, 1),
            (crate::domains::pipeline::models::JobStatus::Retrying, 1),
        ]);

        let run_counts = RunCounts::from_status_counts(&counts);
        assert_eq!(run_counts.sent, 5);
        assert_eq!(run_counts.failed, 2);
        assert_eq!(run_counts.skipped, 4);
        assert_eq!(run_counts.pending, 4);
        assert_eq!(run_counts.processed(), 11);
    }
}
