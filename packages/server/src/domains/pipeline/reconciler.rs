//! Webhook reconciler: folds provider delivery callbacks into job state.
//!
//! Events are correlated to jobs through the stored provider message id. The
//! `from = sent` guard lives in the store's locked transition, so a late
//! sender response and a webhook can race safely: one of them wins, the
//! other sees `InvalidStateTransition` and is dropped. Timeline writes are
//! best-effort — a timeline failure never fails the webhook.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::domains::contacts::{ContactRepository, NewTimelineEvent, TimelineEventKind};
use crate::kernel::events::EventPublisher;

use super::error::StoreError;
use super::events::PipelineEvent;
use super::failure_log::FailureLog;
use super::models::{JobStatus, NewPipelineFailure, PipelineJob};
use super::store::JobStore;

type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Signature verification
// ============================================================================

/// Verifies webhook signatures: HMAC-SHA-256 over `timestamp || raw_body`
/// against a base64-encoded shared key, compared in constant time.
#[derive(Clone)]
pub struct WebhookVerifier {
    key: Option<Vec<u8>>,
}

impl WebhookVerifier {
    /// Build from the configured base64 key. An undecodable key is treated
    /// as absent (and logged), which keeps the endpoint available.
    pub fn from_base64_key(key: Option<&str>) -> Self {
        let key = key.and_then(|raw| match BASE64.decode(raw) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::error!(error = %e, "webhook verification key is not valid base64");
                None
            }
        });
        Self { key }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    /// Check a signature. Returns `true` when no key is configured — the
    /// caller is expected to log a warning in that case.
    pub fn verify(&self, timestamp: &str, body: &[u8], signature_b64: &str) -> bool {
        let Some(key) = &self.key else {
            return true;
        };

        let Ok(signature) = BASE64.decode(signature_b64) else {
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(timestamp.as_bytes());
        mac.update(body);
        mac.verify_slice(&signature).is_ok()
    }
}

// ============================================================================
// Provider events
// ============================================================================

/// One entry of the provider's event webhook batch (SendGrid shape).
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub event: String,
    pub sg_message_id: Option<String>,
    pub email: Option<String>,
    pub timestamp: Option<i64>,
    /// Bounce classification (`hard` / `soft`).
    #[serde(rename = "type")]
    pub bounce_type: Option<String>,
    pub reason: Option<String>,
    pub ip: Option<String>,
    pub useragent: Option<String>,
    pub url: Option<String>,
}

/// Providers append routing suffixes after a dot; the stored id is the bare
/// prefix.
pub fn strip_provider_suffix(id: &str) -> &str {
    id.split('.').next().unwrap_or(id)
}

/// What applying one event did, for the endpoint's internal counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Job advanced to `delivered`.
    Delivered,
    /// Job advanced to `failed` (bounce/drop).
    Failed,
    /// Only contact-timeline state was recorded.
    Recorded,
    /// Dropped: unknown id, foreign event, stale status, or no-op kind.
    Ignored,
}

// ============================================================================
// Reconciler
// ============================================================================

pub struct WebhookReconciler {
    store: Arc<dyn JobStore>,
    failures: Arc<dyn FailureLog>,
    contacts: Arc<dyn ContactRepository>,
    events: EventPublisher,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        failures: Arc<dyn FailureLog>,
        contacts: Arc<dyn ContactRepository>,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            failures,
            contacts,
            events,
        }
    }

    /// Apply one provider event. Returns what happened; storage errors other
    /// than state-machine refusals bubble up.
    pub async fn apply_event(&self, event: &ProviderEvent) -> Result<Applied, StoreError> {
        let Some(raw_id) = event.sg_message_id.as_deref() else {
            tracing::debug!(event = %event.event, "provider event without message id, dropping");
            return Ok(Applied::Ignored);
        };
        let provider_message_id = strip_provider_suffix(raw_id);

        let Some(job) = self
            .store
            .find_by_provider_message_id(provider_message_id)
            .await?
        else {
            tracing::debug!(
                provider_message_id = %provider_message_id,
                event = %event.event,
                "no job for provider message id, dropping"
            );
            return Ok(Applied::Ignored);
        };

        match event.event.as_str() {
            "delivered" => self.apply_delivered(&job).await,
            "bounce" | "dropped" => self.apply_bounce(&job, event).await,
            "open" => {
                self.record_timeline(&job, TimelineEventKind::EmailOpened, event)
                    .await;
                Ok(Applied::Recorded)
            }
            "click" => {
                self.record_timeline(&job, TimelineEventKind::EmailClicked, event)
                    .await;
                Ok(Applied::Recorded)
            }
            "spamreport" | "unsubscribe" | "group_unsubscribe" => {
                self.apply_consent_revoked(&job, event).await;
                Ok(Applied::Recorded)
            }
            "deferred" | "processed" => {
                tracing::debug!(job_id = %job.id, event = %event.event, "provider progress event");
                Ok(Applied::Ignored)
            }
            other => {
                tracing::debug!(job_id = %job.id, event = %other, "unhandled provider event");
                Ok(Applied::Ignored)
            }
        }
    }

    async fn apply_delivered(&self, job: &PipelineJob) -> Result<Applied, StoreError> {
        if job.status != JobStatus::Sent {
            tracing::debug!(
                job_id = %job.id,
                status = %job.status,
                "delivered event for job not in sent, dropping"
            );
            return Ok(Applied::Ignored);
        }

        let delivered = match self.store.mark_delivered(job.id).await {
            Ok(job) => job,
            // Raced a concurrent transition; the guard did its work.
            Err(StoreError::InvalidStateTransition { .. }) => return Ok(Applied::Ignored),
            Err(e) => return Err(e),
        };

        self.events
            .publish(
                PipelineEvent::JobDelivered {
                    job_id: delivered.id,
                    provider_message_id: delivered
                        .provider_message_id
                        .clone()
                        .unwrap_or_default(),
                }
                .outbound(delivered.tenant_id, &correlation(&delivered)),
            )
            .await;
        Ok(Applied::Delivered)
    }

    async fn apply_bounce(
        &self,
        job: &PipelineJob,
        event: &ProviderEvent,
    ) -> Result<Applied, StoreError> {
        if job.status != JobStatus::Sent {
            tracing::debug!(
                job_id = %job.id,
                status = %job.status,
                event = %event.event,
                "bounce event for job not in sent, dropping"
            );
            return Ok(Applied::Ignored);
        }

        let message = bounce_message(event);
        let failed = match self.store.mark_failed(job.id, &message, None).await {
            Ok(job) => job,
            Err(StoreError::InvalidStateTransition { .. }) => return Ok(Applied::Ignored),
            Err(e) => return Err(e),
        };

        self.failures
            .record(NewPipelineFailure::for_job(job, &message))
            .await?;
        self.record_timeline(job, TimelineEventKind::EmailBounced, event)
            .await;
        self.events
            .publish(
                PipelineEvent::JobFailed {
                    job_id: failed.id,
                    error: message,
                    attempt: failed.retry_count + 1,
                    will_retry: false,
                }
                .outbound(failed.tenant_id, &correlation(&failed)),
            )
            .await;
        Ok(Applied::Failed)
    }

    async fn apply_consent_revoked(&self, job: &PipelineJob, event: &ProviderEvent) {
        if let Err(e) = self
            .contacts
            .revoke_consent(job.tenant_id, job.contact_id)
            .await
        {
            tracing::warn!(
                contact_id = %job.contact_id,
                error = %e,
                "failed to revoke contact consent"
            );
        }

        let data = serde_json::json!({
            "consent": "revoked",
            "source": event.event,
            "email": event.email,
        });
        self.append_timeline(job, TimelineEventKind::ConsentUpdated, data)
            .await;
    }

    async fn record_timeline(
        &self,
        job: &PipelineJob,
        kind: TimelineEventKind,
        event: &ProviderEvent,
    ) {
        let data = serde_json::json!({
            "event": event.event,
            "bounce_type": event.bounce_type,
            "reason": event.reason,
            "ip": event.ip,
            "user_agent": event.useragent,
            "url": event.url,
            "job_id": job.id,
        });
        self.append_timeline(job, kind, data).await;
    }

    async fn append_timeline(
        &self,
        job: &PipelineJob,
        kind: TimelineEventKind,
        data: serde_json::Value,
    ) {
        let result = self
            .contacts
            .create_timeline_event(NewTimelineEvent {
                tenant_id: job.tenant_id,
                contact_id: job.contact_id,
                kind,
                data,
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(
                contact_id = %job.contact_id,
                kind = %kind,
                error = %e,
                "failed to record timeline event"
            );
        }
    }
}

/// Operator-facing error message for a bounce or drop.
fn bounce_message(event: &ProviderEvent) -> String {
    let reason = event.reason.as_deref().unwrap_or("no reason given");
    if event.event == "dropped" {
        format!("Dropped: {reason}")
    } else {
        let bounce_type = event.bounce_type.as_deref().unwrap_or("unknown");
        format!("Bounce({bounce_type}): {reason}")
    }
}

fn correlation(job: &PipelineJob) -> String {
    job.correlation_id
        .clone()
        .unwrap_or_else(|| job.id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(key: &[u8], timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(timestamp.as_bytes());
        mac.update(body);
        BASE64.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn strips_provider_suffixes() {
        assert_eq!(strip_provider_suffix("m1.filter0001"), "m1");
        assert_eq!(strip_provider_suffix("m1"), "m1");
        assert_eq!(strip_provider_suffix("abc.def.ghi"), "abc");
    }

    #[test]
    fn verifier_accepts_a_valid_signature() {
        let key = b"shared-webhook-secret";
        let verifier = WebhookVerifier::from_base64_key(Some(&BASE64.encode(key)));
        assert!(verifier.is_configured());

        let body = br#"[{"event":"delivered","sg_message_id":"m1"}]"#;
        let signature = sign(key, "1722500000", body);
        assert!(verifier.verify("1722500000", body, &signature));
    }

    #[test]
    fn verifier_rejects_tampered_bodies_and_timestamps() {
        let key = b"shared-webhook-secret";
        let verifier = WebhookVerifier::from_base64_key(Some(&BASE64.encode(key)));

        let body = br#"[{"event":"delivered"}]"#;
        let signature = sign(key, "1722500000", body);
        assert!(!verifier.verify("1722500000", b"[]", &signature));
        assert!(!verifier.verify("1722500001", body, &signature));
        assert!(!verifier.verify("1722500000", body, "not-base64!!"));
    }

    #[test]
    fn verifier_without_a_key_accepts_everything() {
        let verifier = WebhookVerifier::from_base64_key(None);
        assert!(!verifier.is_configured());
        assert!(verifier.verify("0", b"{}", "anything"));
    }

    #[test]
    fn bounce_messages_carry_type_and_reason() {
        let event = ProviderEvent {
            event: "bounce".to_string(),
            sg_message_id: Some("m1.filter".to_string()),
            email: None,
            timestamp: None,
            bounce_type: Some("hard".to_string()),
            reason: Some("user unknown".to_string()),
            ip: None,
            useragent: None,
            url: None,
        };
        assert_eq!(bounce_message(&event), "Bounce(hard): user unknown");

        let dropped = ProviderEvent {
            event: "dropped".to_string(),
            reason: Some("invalid".to_string()),
            ..event
        };
        assert_eq!(bounce_message(&dropped), "Dropped: invalid");
    }
}
