//! Polling worker: the broker-less fallback mode.
//!
//! Claims ready jobs straight from the store with `acquire_next_pending`
//! (row-level locks, skip on contention) and processes them with a bounded
//! in-flight count. Selected with `PIPELINE_USE_BROKER=false`; also the path
//! that drains jobs left `pending` when a broker hand-off failed.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::PipelineError;
use super::models::PipelineJob;
use super::processor::JobProcessor;
use super::store::JobStore;

#[derive(Debug, Clone)]
pub struct PollingWorkerConfig {
    /// How long to wait when no jobs are ready.
    pub poll_interval: Duration,
    /// Maximum jobs processed concurrently per poll cycle.
    pub max_in_flight: usize,
    /// Restrict claims to one tenant; `None` polls across tenants.
    pub tenant_id: Option<Uuid>,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for PollingWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_in_flight: 10,
            tenant_id: None,
            worker_id: format!("poller-{}", Uuid::new_v4()),
        }
    }
}

/// Background service that drains the job store without a broker.
pub struct PollingWorker {
    processor: Arc<JobProcessor>,
    config: PollingWorkerConfig,
}

impl PollingWorker {
    pub fn new(processor: Arc<JobProcessor>) -> Self {
        Self {
            processor,
            config: PollingWorkerConfig::default(),
        }
    }

    pub fn with_config(processor: Arc<JobProcessor>, config: PollingWorkerConfig) -> Self {
        Self { processor, config }
    }

    /// Run until shutdown is requested. The in-flight batch is drained
    /// before exiting.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            max_in_flight = self.config.max_in_flight,
            "polling worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let claimed = self.claim_batch().await;

            if claimed.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            tracing::debug!(count = claimed.len(), "claimed jobs");

            let handles = claimed
                .into_iter()
                .map(|job| self.handle(job, &shutdown))
                .collect::<Vec<_>>();
            futures::future::join_all(handles).await;
        }

        tracing::info!(worker_id = %self.config.worker_id, "polling worker stopped");
    }

    /// Claim up to `max_in_flight` ready jobs. Claim errors end the batch
    /// early; whatever was already claimed still gets processed.
    async fn claim_batch(&self) -> Vec<PipelineJob> {
        let mut claimed = Vec::new();
        while claimed.len() < self.config.max_in_flight {
            match self
                .processor
                .store()
                .acquire_next_pending(self.config.tenant_id)
                .await
            {
                Ok(Some(job)) => claimed.push(job),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to claim job");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    break;
                }
            }
        }
        claimed
    }

    async fn handle(&self, job: PipelineJob, shutdown: &CancellationToken) {
        let job_id = job.id;
        let attempt = job.retry_count + 1;

        match self.processor.process(job_id, false, shutdown).await {
            Ok(outcome) => {
                tracing::debug!(
                    job_id = %job_id,
                    success = outcome.success,
                    skipped = outcome.skipped,
                    "job processed"
                );
            }
            Err(PipelineError::PipelineJobNotFound(_)) => {
                // Nothing to mark; the row is gone.
                tracing::error!(job_id = %job_id, "job row vanished, dropping attempt");
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "job attempt failed");
                if let Err(hook_err) = self.processor.on_failed(job_id, &e, attempt).await {
                    tracing::error!(
                        job_id = %job_id,
                        error = %hook_err,
                        "failed to record job failure"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PollingWorkerConfig::default();
        assert_eq!(config.max_in_flight, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.worker_id.starts_with("poller-"));
        assert!(config.tenant_id.is_none());
    }
}
