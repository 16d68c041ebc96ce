//! Retry controller and stuck-job reaper.
//!
//! Runs at a fixed tick in both broker and poller modes: it is the only
//! dead-letter escalation path in poller mode and the safety net when the
//! broker loses a scheduled retry. Each tick also reaps jobs stuck in
//! `processing` (crashed workers) back to `failed` so they re-enter the
//! retry flow — the only safe recovery for a claim that never completes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::domains::campaigns::StatsAggregator;
use crate::kernel::events::EventPublisher;

use super::error::StoreError;
use super::events::PipelineEvent;
use super::failure_log::FailureLog;
use super::models::{JobStatus, NewPipelineFailure, PipelineJob};
use super::queue::WorkBroker;
use super::store::JobStore;

const REAPER_ERROR: &str = "processing timed out, reclaimed by the stuck-job reaper";

#[derive(Debug, Clone)]
pub struct RetryControllerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub max_retries: i32,
    pub base_interval: Duration,
    pub multiplier: u32,
    pub stuck_threshold: Duration,
}

impl Default for RetryControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            max_retries: 3,
            base_interval: Duration::from_secs(60),
            multiplier: 2,
            stuck_threshold: Duration::from_secs(600),
        }
    }
}

impl From<&PipelineConfig> for RetryControllerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.retry_poll_interval,
            batch_size: 100,
            max_retries: config.max_retries,
            base_interval: config.retry_interval,
            multiplier: config.backoff_multiplier,
            stuck_threshold: config.stuck_threshold,
        }
    }
}

pub struct RetryController {
    store: Arc<dyn JobStore>,
    failures: Arc<dyn FailureLog>,
    stats: StatsAggregator,
    events: EventPublisher,
    broker: Option<WorkBroker>,
    config: RetryControllerConfig,
}

impl RetryController {
    pub fn new(
        store: Arc<dyn JobStore>,
        failures: Arc<dyn FailureLog>,
        stats: StatsAggregator,
        events: EventPublisher,
        broker: Option<WorkBroker>,
        config: RetryControllerConfig,
    ) -> Self {
        Self {
            store,
            failures,
            stats,
            events,
            broker,
            config,
        }
    }

    /// Run until shutdown. An in-flight tick always completes before exit.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "retry controller starting"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race service startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "retry controller tick failed");
            }
        }

        tracing::info!("retry controller stopped");
    }

    /// One controller pass: reap stuck claims, then settle due retries.
    pub async fn tick(&self) -> Result<(), StoreError> {
        self.reap_stuck().await?;
        self.settle_due().await?;
        Ok(())
    }

    /// Move `processing` rows older than the stuck threshold back to
    /// `failed`, due immediately, so the next pass reschedules them.
    async fn reap_stuck(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stuck_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));

        for job in self
            .store
            .stuck_processing(cutoff, self.config.batch_size)
            .await?
        {
            tracing::warn!(
                job_id = %job.id,
                processing_at = ?job.processing_at,
                "reaping stuck job"
            );
            match self
                .store
                .mark_failed(job.id, REAPER_ERROR, Some(Utc::now()))
                .await
            {
                Ok(failed) => {
                    self.publish(
                        &failed,
                        PipelineEvent::JobFailed {
                            job_id: failed.id,
                            error: REAPER_ERROR.to_string(),
                            attempt: failed.retry_count + 1,
                            will_retry: true,
                        },
                    )
                    .await;
                }
                // The worker finished in the window between the scan and the
                // lock; the state machine already settled the job.
                Err(StoreError::InvalidStateTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Promote due `failed` jobs to `retrying`, escalate exhausted ones to
    /// `dead`, and re-dispatch `retrying` jobs the broker lost.
    async fn settle_due(&self) -> Result<(), StoreError> {
        for job in self
            .store
            .jobs_due_for_retry(self.config.max_retries, self.config.batch_size)
            .await?
        {
            if job.retry_count >= self.config.max_retries {
                self.escalate_dead(&job).await?;
                continue;
            }

            match job.status {
                JobStatus::Failed => {
                    let retry_count = job.retry_count + 1;
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(retry_delay(&self.config, job.retry_count))
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    match self
                        .store
                        .schedule_retry(job.id, retry_count, next_attempt_at)
                        .await
                    {
                        Ok(scheduled) => {
                            self.publish(
                                &scheduled,
                                PipelineEvent::JobRetrying {
                                    job_id: scheduled.id,
                                    retry_count,
                                    next_attempt_at,
                                },
                            )
                            .await;
                        }
                        Err(StoreError::InvalidStateTransition { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                JobStatus::Retrying => {
                    // Due but still sitting in retrying: in broker mode the
                    // broker dropped it (restart); re-dispatch. In poller
                    // mode the claim query picks it up on its own.
                    if let Some(broker) = &self.broker {
                        broker.retry(&job);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn escalate_dead(&self, job: &PipelineJob) -> Result<(), StoreError> {
        let message = job
            .error_message
            .clone()
            .unwrap_or_else(|| "retries exhausted".to_string());

        let dead = match self.store.mark_dead(job.id, &message, None).await {
            Ok(dead) => dead,
            // Lost the race against a concurrent escalation.
            Err(StoreError::InvalidStateTransition { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };

        self.failures
            .record(NewPipelineFailure::for_job(job, &message))
            .await?;
        self.stats
            .increment_failed(job.campaign_run_id, &correlation(job))
            .await?;
        self.publish(
            &dead,
            PipelineEvent::JobDead {
                job_id: job.id,
                total_attempts: job.retry_count,
                final_error: message,
            },
        )
        .await;

        tracing::warn!(job_id = %job.id, retries = job.retry_count, "retries exhausted, job dead");
        Ok(())
    }

    async fn publish(&self, job: &PipelineJob, event: PipelineEvent) {
        self.events
            .publish(event.outbound(job.tenant_id, &correlation(job)))
            .await;
    }
}

/// `base_interval * multiplier^retry_count`, capped at one hour.
fn retry_delay(config: &RetryControllerConfig, retry_count: i32) -> Duration {
    let factor = config
        .multiplier
        .saturating_pow(retry_count.max(0) as u32)
        .max(1) as u64;
    let millis = (config.base_interval.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis.min(3_600_000))
}

fn correlation(job: &PipelineJob) -> String {
    job.correlation_id
        .clone()
        .unwrap_or_else(|| job.id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = RetryControllerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_interval, Duration::from_secs(60));
        assert_eq!(config.multiplier, 2);
    }

    #[test]
    fn retry_delay_is_exponential_in_retry_count() {
        let config = RetryControllerConfig::default();
        assert_eq!(retry_delay(&config, 0), Duration::from_secs(60));
        assert_eq!(retry_delay(&config, 1), Duration::from_secs(120));
        assert_eq!(retry_delay(&config, 2), Duration::from_secs(240));
    }

    #[test]
    fn retry_delay_is_capped() {
        let config = RetryControllerConfig::default();
        assert_eq!(retry_delay(&config, 20), Duration::from_secs(3_600));
    }
}
