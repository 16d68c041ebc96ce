//! Fans a campaign run out into pipeline jobs.
//!
//! The producer is the only component that creates jobs. It composes the
//! channel payload for each contact, bulk-inserts everything in `Pending`,
//! hands the batch to the work broker with per-tenant delay spacing, and
//! flips the handed-off jobs to `Queued`. If no broker is available the jobs
//! stay `Pending` for the polling worker to pick up.

use std::str::FromStr;
use std::sync::Arc;

use serde_json::Map;
use uuid::Uuid;

use crate::domains::campaigns::StatsAggregator;
use crate::kernel::events::EventPublisher;

use super::error::PipelineError;
use super::events::PipelineEvent;
use super::models::{Channel, JobPayload, PipelineJob, SkipReason};
use super::queue::WorkBroker;
use super::store::JobStore;

/// Campaign-run coordinates handed in by the campaign service.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub campaign_id: Uuid,
    pub tenant_id: Uuid,
    pub channel: String,
    pub template_version_id: Option<Uuid>,
}

/// A resolved audience member.
#[derive(Debug, Clone, Default)]
pub struct ContactRecord {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub attributes: Option<Map<String, serde_json::Value>>,
}

pub struct Producer {
    store: Arc<dyn JobStore>,
    stats: StatsAggregator,
    events: EventPublisher,
    broker: Option<WorkBroker>,
}

impl Producer {
    pub fn new(
        store: Arc<dyn JobStore>,
        stats: StatsAggregator,
        events: EventPublisher,
        broker: Option<WorkBroker>,
    ) -> Self {
        Self {
            store,
            stats,
            events,
            broker,
        }
    }

    /// Create one job per contact and queue the batch.
    ///
    /// An empty contact list is a no-op, not an error. Contacts that already
    /// have a job in this run are created and immediately skipped with
    /// `duplicate_send`, which keeps the run's processed accounting aligned
    /// with its recipient total.
    pub async fn dispatch_run(
        &self,
        run: RunInfo,
        contacts: Vec<ContactRecord>,
    ) -> Result<Vec<PipelineJob>, PipelineError> {
        if contacts.is_empty() {
            tracing::debug!(campaign_run_id = %run.run_id, "empty contact list, nothing to dispatch");
            return Ok(Vec::new());
        }

        let channel = Channel::from_str(&run.channel)
            .map_err(|_| PipelineError::ChannelNotSupported(run.channel.clone()))?;

        let correlation_id = Uuid::new_v4().to_string();
        let already_in_run = self.store.contact_ids_in_run(run.run_id).await?;

        let mut jobs = Vec::with_capacity(contacts.len());
        let mut duplicate_ids = Vec::new();
        for contact in &contacts {
            let mut job = PipelineJob::builder()
                .tenant_id(run.tenant_id)
                .campaign_id(run.campaign_id)
                .campaign_run_id(run.run_id)
                .contact_id(contact.id)
                .channel(channel)
                .payload(compose_payload(channel, contact).to_value())
                .correlation_id(correlation_id.clone())
                .build();
            job.template_version_id = run.template_version_id;

            if already_in_run.contains(&contact.id) {
                duplicate_ids.push(job.id);
            }
            jobs.push(job);
        }

        let created = self.store.create_bulk(jobs).await?;
        tracing::info!(
            campaign_run_id = %run.run_id,
            campaign_id = %run.campaign_id,
            channel = %channel,
            job_count = created.len(),
            duplicates = duplicate_ids.len(),
            correlation_id = %correlation_id,
            "created pipeline jobs"
        );

        self.events
            .publish(
                PipelineEvent::BatchCreated {
                    campaign_run_id: run.run_id,
                    campaign_id: run.campaign_id,
                    job_count: created.len(),
                }
                .outbound(run.tenant_id, &correlation_id),
            )
            .await;

        let job_created_events = created
            .iter()
            .map(|job| {
                PipelineEvent::JobCreated {
                    job_id: job.id,
                    campaign_id: job.campaign_id,
                    campaign_run_id: job.campaign_run_id,
                    contact_id: job.contact_id,
                    channel: job.channel,
                }
                .outbound(job.tenant_id, &correlation_id)
            })
            .collect();
        self.events.publish_batch(job_created_events).await;

        // Settle duplicates before the hand-off so they never reach a sender.
        for job_id in &duplicate_ids {
            self.store
                .mark_skipped(
                    *job_id,
                    SkipReason::DuplicateSend,
                    "contact already has a job in this run",
                )
                .await?;
            self.stats
                .increment_skipped(run.run_id, &correlation_id)
                .await?;
        }

        let queueable: Vec<PipelineJob> = created
            .iter()
            .filter(|job| !duplicate_ids.contains(&job.id))
            .cloned()
            .collect();

        if let Some(broker) = &self.broker {
            let ids: Vec<Uuid> = queueable.iter().map(|job| job.id).collect();
            match self.store.mark_queued_bulk(&ids).await {
                Ok(queued) => {
                    broker.enqueue_bulk(&queueable);
                    self.events
                        .publish(
                            PipelineEvent::BatchCompleted {
                                campaign_run_id: run.run_id,
                                campaign_id: run.campaign_id,
                                queued_count: queued as usize,
                            }
                            .outbound(run.tenant_id, &correlation_id),
                        )
                        .await;
                }
                Err(e) => {
                    // Jobs stay pending; the polling fallback will claim them.
                    tracing::error!(
                        campaign_run_id = %run.run_id,
                        error = %e,
                        "failed to queue batch, leaving jobs pending"
                    );
                }
            }
        }

        Ok(created)
    }
}

/// Compose the payload for one contact: the address the channel dispatches
/// to, the display name, and pass-through attributes for rendering.
fn compose_payload(channel: Channel, contact: &ContactRecord) -> JobPayload {
    let attributes = contact.attributes.clone().unwrap_or_default();
    let address = match channel {
        Channel::Email => contact.email.clone(),
        Channel::Sms | Channel::Whatsapp => contact.phone.clone(),
        Channel::Push => attributes
            .get("push_token")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    };

    JobPayload {
        address,
        full_name: contact.full_name.clone(),
        attributes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(email: Option<&str>, phone: Option<&str>) -> ContactRecord {
        ContactRecord {
            id: Uuid::new_v4(),
            email: email.map(str::to_string),
            phone: phone.map(str::to_string),
            full_name: Some("Grace Hopper".to_string()),
            attributes: None,
        }
    }

    #[test]
    fn email_payload_carries_the_email_address() {
        let payload = compose_payload(Channel::Email, &contact(Some("g@example.com"), None));
        assert_eq!(payload.address.as_deref(), Some("g@example.com"));
        assert_eq!(payload.full_name.as_deref(), Some("Grace Hopper"));
    }

    #[test]
    fn sms_and_whatsapp_payloads_carry_the_phone() {
        let c = contact(None, Some("+15551230000"));
        assert_eq!(
            compose_payload(Channel::Sms, &c).address.as_deref(),
            Some("+15551230000")
        );
        assert_eq!(
            compose_payload(Channel::Whatsapp, &c).address.as_deref(),
            Some("+15551230000")
        );
    }

    #[test]
    fn push_payload_resolves_the_device_token_attribute() {
        let mut attributes = Map::new();
        attributes.insert(
            "push_token".to_string(),
            serde_json::json!("ExponentPushToken[abc]"),
        );
        let c = ContactRecord {
            id: Uuid::new_v4(),
            attributes: Some(attributes),
            ..Default::default()
        };
        assert_eq!(
            compose_payload(Channel::Push, &c).address.as_deref(),
            Some("ExponentPushToken[abc]")
        );
    }

    #[test]
    fn missing_addresses_stay_missing() {
        let payload = compose_payload(Channel::Email, &contact(None, Some("+1555")));
        assert!(payload.address.is_none());
    }
}
