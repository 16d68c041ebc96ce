//! The job worker.
//!
//! [`JobProcessor::process`] runs one attempt: fetch, claim, resolve the
//! contact, validate the recipient, render the template, dispatch through
//! the channel sender, and record the outcome. Skips are terminal
//! non-failures handled inline; retryable dispatch errors are returned to
//! the caller (broker or poller), which reports them through
//! [`JobProcessor::on_failed`] — the only code path that accounts failures,
//! so `increment_failed` fires exactly once per job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::domains::campaigns::StatsAggregator;
use crate::domains::contacts::ContactRepository;
use crate::domains::templates::TemplateService;
use crate::kernel::events::EventPublisher;

use super::error::{PipelineError, StoreError};
use super::events::PipelineEvent;
use super::failure_log::FailureLog;
use super::models::{Channel, JobStatus, NewPipelineFailure, PipelineJob, SkipReason};
use super::senders::{ChannelSender, SendMetadata, SenderRegistry};
use super::store::JobStore;

/// Worker tunables, lifted from [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_retries: i32,
    pub retry_interval: Duration,
    pub backoff_multiplier: u32,
}

impl From<&PipelineConfig> for ProcessorConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_interval: config.retry_interval,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

/// Outcome of one processed attempt.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    pub success: bool,
    pub skipped: bool,
}

impl ProcessOutcome {
    fn sent() -> Self {
        Self {
            success: true,
            skipped: false,
        }
    }

    fn skipped() -> Self {
        Self {
            success: false,
            skipped: true,
        }
    }
}

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    failures: Arc<dyn FailureLog>,
    contacts: Arc<dyn ContactRepository>,
    templates: Arc<dyn TemplateService>,
    senders: Arc<SenderRegistry>,
    stats: StatsAggregator,
    events: EventPublisher,
    config: ProcessorConfig,
}

impl JobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        failures: Arc<dyn FailureLog>,
        contacts: Arc<dyn ContactRepository>,
        templates: Arc<dyn TemplateService>,
        senders: Arc<SenderRegistry>,
        stats: StatsAggregator,
        events: EventPublisher,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            failures,
            contacts,
            templates,
            senders,
            stats,
            events,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run one attempt for `job_id`.
    ///
    /// `claim` is set on the broker path, where the job still sits in
    /// `Queued`/`Retrying` and must be moved to `Processing` here; the
    /// poller claims during `acquire_next_pending` instead. Cancellation is
    /// honored up to the dispatch call: once the sender has been invoked the
    /// attempt runs to completion, because the provider may already have
    /// accepted the message.
    pub async fn process(
        &self,
        job_id: Uuid,
        claim: bool,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, PipelineError> {
        let mut job = self.store.get(job_id).await.map_err(|e| match e {
            StoreError::JobNotFound(id) => PipelineError::PipelineJobNotFound(id),
            other => PipelineError::Store(other),
        })?;

        if claim {
            job = self
                .store
                .transition(job_id, JobStatus::Processing, Default::default())
                .await?;
        }

        let correlation = correlation_id(&job);
        let attempt = job.retry_count + 1;
        self.events
            .publish(
                PipelineEvent::JobStarted { job_id, attempt }.outbound(job.tenant_id, &correlation),
            )
            .await;

        tracing::debug!(
            job_id = %job_id,
            channel = %job.channel,
            attempt,
            "processing pipeline job"
        );

        // Resolve the contact.
        let contact = match self
            .contacts
            .find_by_id(job.tenant_id, job.contact_id)
            .await
            .map_err(PipelineError::Internal)?
        {
            Some(contact) => contact,
            None => {
                return self
                    .skip(
                        &job,
                        SkipReason::ContactNotFound,
                        &format!("contact {} not found", job.contact_id),
                        &correlation,
                    )
                    .await;
            }
        };

        if contact.unsubscribed {
            return self
                .skip(
                    &job,
                    SkipReason::Unsubscribed,
                    "contact has revoked messaging consent",
                    &correlation,
                )
                .await;
        }

        let sender = self.senders.get(job.channel)?;

        // Validate the recipient address for the channel.
        let payload = job.payload();
        let address = match payload.address.as_deref().filter(|a| !a.trim().is_empty()) {
            Some(address) => address.to_string(),
            None => {
                let (reason, message) = missing_address(job.channel);
                return self.skip(&job, reason, message, &correlation).await;
            }
        };

        let validation = sender.validate_recipient(&address);
        if !validation.valid {
            let reason = invalid_address(job.channel);
            let message = validation
                .error
                .unwrap_or_else(|| "recipient failed validation".to_string());
            return self.skip(&job, reason, &message, &correlation).await;
        }

        // Render the template.
        let content = match self
            .templates
            .render_for_pipeline(job.template_version_id, &contact, job.channel)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                return self
                    .skip(&job, SkipReason::TemplateError, &e.to_string(), &correlation)
                    .await;
            }
        };

        // Cancellation is honored before the provider call only.
        if cancel.is_cancelled() {
            return Err(PipelineError::SendFailed {
                message: "attempt cancelled before dispatch".to_string(),
                retryable: true,
            });
        }

        // Dispatch.
        let meta = SendMetadata {
            tenant_id: job.tenant_id,
            correlation_id: correlation.clone(),
            campaign_id: job.campaign_id,
            job_id: job.id,
            contact_id: contact.id,
        };
        let outcome = sender.send(&address, &content, &meta).await;

        if outcome.success {
            let provider_message_id = match outcome.provider_message_id {
                Some(id) => id,
                None => {
                    return Err(PipelineError::SendFailed {
                        message: "sender reported success without a provider message id"
                            .to_string(),
                        retryable: false,
                    });
                }
            };

            self.store.mark_sent(job.id, &provider_message_id).await?;
            self.stats
                .increment_sent(job.campaign_run_id, &correlation)
                .await?;
            self.events
                .publish(
                    PipelineEvent::JobSent {
                        job_id: job.id,
                        provider_message_id,
                    }
                    .outbound(job.tenant_id, &correlation),
                )
                .await;
            return Ok(ProcessOutcome::sent());
        }

        let message = outcome
            .error
            .unwrap_or_else(|| "provider rejected the message".to_string());

        if outcome.retryable {
            // The broker (or retry controller) owns rescheduling; nothing is
            // marked here.
            return Err(PipelineError::SendFailed {
                message,
                retryable: true,
            });
        }

        // Unrecoverable provider error: record it, then surface so the
        // caller halts retries through `on_failed`.
        self.store.mark_failed(job.id, &message, None).await?;
        self.events
            .publish(
                PipelineEvent::JobFailed {
                    job_id: job.id,
                    error: message.clone(),
                    attempt,
                    will_retry: false,
                }
                .outbound(job.tenant_id, &correlation),
            )
            .await;
        Err(PipelineError::SendFailed {
            message,
            retryable: false,
        })
    }

    /// Failure hook, invoked after an attempt returned an error.
    ///
    /// This is the single failure-accounting path: on the final attempt (or
    /// an unrecoverable error) the job goes dead, one `PipelineFailure` row
    /// is written, and `increment_failed` fires; otherwise the job is
    /// scheduled for retry with exponential backoff.
    pub async fn on_failed(
        &self,
        job_id: Uuid,
        error: &PipelineError,
        attempts_made: i32,
    ) -> Result<(), StoreError> {
        let job = self.store.get(job_id).await?;
        let correlation = correlation_id(&job);
        let message = error.to_string();
        let retryable = error.retryable();
        let will_retry = retryable && attempts_made < self.config.max_retries;

        // Only an attempt that still owns the processing window may be
        // failed here; anything else is a stale callback racing a path that
        // already settled the job.
        if !matches!(job.status, JobStatus::Processing | JobStatus::Failed) {
            tracing::warn!(
                job_id = %job_id,
                status = %job.status,
                "stale failure callback, ignoring"
            );
            return Ok(());
        }

        // `process` may already have marked unrecoverable errors as failed.
        if job.status != JobStatus::Failed {
            self.store
                .mark_failed(job_id, &message, None)
                .await?;
            self.events
                .publish(
                    PipelineEvent::JobFailed {
                        job_id,
                        error: message.clone(),
                        attempt: attempts_made,
                        will_retry,
                    }
                    .outbound(job.tenant_id, &correlation),
                )
                .await;
        }

        if will_retry {
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(self.backoff_delay(attempts_made))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.store
                .schedule_retry(job_id, attempts_made, next_attempt_at)
                .await?;
            self.events
                .publish(
                    PipelineEvent::JobRetrying {
                        job_id,
                        retry_count: attempts_made,
                        next_attempt_at,
                    }
                    .outbound(job.tenant_id, &correlation),
                )
                .await;
            return Ok(());
        }

        // Final attempt or unrecoverable: dead-letter with exactly-once
        // failure accounting.
        self.store
            .mark_dead(job_id, &message, Some(attempts_made))
            .await?;
        self.failures
            .record(NewPipelineFailure::for_job(&job, &message))
            .await?;
        self.stats
            .increment_failed(job.campaign_run_id, &correlation)
            .await?;
        self.events
            .publish(
                PipelineEvent::JobDead {
                    job_id,
                    total_attempts: attempts_made,
                    final_error: message,
                }
                .outbound(job.tenant_id, &correlation),
            )
            .await;

        tracing::warn!(job_id = %job_id, attempts = attempts_made, "pipeline job dead-lettered");
        Ok(())
    }

    /// Exponential backoff for the n-th failed attempt (1-based).
    pub fn backoff_delay(&self, attempts_made: i32) -> Duration {
        compute_backoff(&self.config, attempts_made)
    }

    async fn skip(
        &self,
        job: &PipelineJob,
        reason: SkipReason,
        message: &str,
        correlation: &str,
    ) -> Result<ProcessOutcome, PipelineError> {
        tracing::info!(
            job_id = %job.id,
            reason = %reason,
            "skipping pipeline job"
        );
        self.store.mark_skipped(job.id, reason, message).await?;
        self.stats
            .increment_skipped(job.campaign_run_id, correlation)
            .await?;
        Ok(ProcessOutcome::skipped())
    }
}

/// `retry_interval * multiplier^(attempts_made - 1)`, capped at one hour so
/// a long retry chain cannot park a job forever.
pub(crate) fn compute_backoff(config: &ProcessorConfig, attempts_made: i32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).max(0) as u32;
    let factor = config.backoff_multiplier.saturating_pow(exponent).max(1) as u64;
    let millis = (config.retry_interval.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis.min(3_600_000))
}

fn correlation_id(job: &PipelineJob) -> String {
    job.correlation_id
        .clone()
        .unwrap_or_else(|| job.id.to_string())
}

fn missing_address(channel: Channel) -> (SkipReason, &'static str) {
    match channel {
        Channel::Email => (SkipReason::MissingEmail, "contact has no email address"),
        Channel::Sms | Channel::Whatsapp => {
            (SkipReason::MissingPhone, "contact has no phone number")
        }
        Channel::Push => (SkipReason::Other, "contact has no device token"),
    }
}

fn invalid_address(channel: Channel) -> SkipReason {
    match channel {
        Channel::Email => SkipReason::InvalidEmail,
        Channel::Sms | Channel::Whatsapp => SkipReason::InvalidPhone,
        Channel::Push => SkipReason::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let config = ProcessorConfig {
            max_retries: 3,
            retry_interval: Duration::from_secs(60),
            backoff_multiplier: 2,
        };
        assert_eq!(compute_backoff(&config, 1), Duration::from_secs(60));
        assert_eq!(compute_backoff(&config, 2), Duration::from_secs(120));
        assert_eq!(compute_backoff(&config, 3), Duration::from_secs(240));
    }

    #[test]
    fn backoff_is_capped_at_one_hour() {
        let config = ProcessorConfig {
            max_retries: 30,
            retry_interval: Duration::from_secs(60),
            backoff_multiplier: 2,
        };
        assert_eq!(compute_backoff(&config, 20), Duration::from_secs(3_600));
    }

    #[test]
    fn missing_address_reasons_per_channel() {
        assert_eq!(missing_address(Channel::Email).0, SkipReason::MissingEmail);
        assert_eq!(missing_address(Channel::Sms).0, SkipReason::MissingPhone);
        assert_eq!(
            missing_address(Channel::Whatsapp).0,
            SkipReason::MissingPhone
        );
        assert_eq!(missing_address(Channel::Push).0, SkipReason::Other);
    }

    #[test]
    fn invalid_address_reasons_per_channel() {
        assert_eq!(invalid_address(Channel::Email), SkipReason::InvalidEmail);
        assert_eq!(invalid_address(Channel::Sms), SkipReason::InvalidPhone);
        assert_eq!(invalid_address(Channel::Push), SkipReason::Other);
    }
}
