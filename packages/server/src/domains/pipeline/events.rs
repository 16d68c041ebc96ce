//! Pipeline lifecycle events.
//!
//! These events are facts about the job lifecycle, not commands. They are
//! wrapped in the shared envelope and published to the named subjects below;
//! consumers outside the pipeline subscribe by subject.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kernel::events::OutboundEvent;

use super::models::Channel;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobCreated {
        job_id: Uuid,
        campaign_id: Uuid,
        campaign_run_id: Uuid,
        contact_id: Uuid,
        channel: Channel,
    },

    JobStarted {
        job_id: Uuid,
        attempt: i32,
    },

    JobSent {
        job_id: Uuid,
        provider_message_id: String,
    },

    JobDelivered {
        job_id: Uuid,
        provider_message_id: String,
    },

    JobFailed {
        job_id: Uuid,
        error: String,
        attempt: i32,
        will_retry: bool,
    },

    JobRetrying {
        job_id: Uuid,
        retry_count: i32,
        next_attempt_at: DateTime<Utc>,
    },

    JobDead {
        job_id: Uuid,
        total_attempts: i32,
        final_error: String,
    },

    BatchCreated {
        campaign_run_id: Uuid,
        campaign_id: Uuid,
        job_count: usize,
    },

    BatchCompleted {
        campaign_run_id: Uuid,
        campaign_id: Uuid,
        queued_count: usize,
    },

    CampaignRunCompleted {
        campaign_run_id: Uuid,
        campaign_id: Uuid,
        status: String,
        total_recipients: i32,
        sent_count: i32,
        failed_count: i32,
        skipped_count: i32,
    },
}

impl PipelineEvent {
    /// Bus subject this event publishes to.
    pub fn subject(&self) -> &'static str {
        match self {
            PipelineEvent::JobCreated { .. } => "pipeline.job.created",
            PipelineEvent::JobStarted { .. } => "pipeline.job.started",
            PipelineEvent::JobSent { .. } => "pipeline.job.sent",
            PipelineEvent::JobDelivered { .. } => "pipeline.job.delivered",
            PipelineEvent::JobFailed { .. } => "pipeline.job.failed",
            PipelineEvent::JobRetrying { .. } => "pipeline.job.retrying",
            PipelineEvent::JobDead { .. } => "pipeline.job.dead",
            PipelineEvent::BatchCreated { .. } => "pipeline.batch.created",
            PipelineEvent::BatchCompleted { .. } => "pipeline.batch.completed",
            PipelineEvent::CampaignRunCompleted { .. } => "pipeline.campaign_run.completed",
        }
    }

    /// Wrap this event for publishing.
    pub fn outbound(self, tenant_id: Uuid, correlation_id: impl Into<String>) -> OutboundEvent {
        let subject = self.subject().to_string();
        let payload = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        OutboundEvent {
            subject,
            tenant_id,
            correlation_id: correlation_id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_subjects_match_the_catalog() {
        let event = PipelineEvent::JobSent {
            job_id: Uuid::new_v4(),
            provider_message_id: "m1".to_string(),
        };
        assert_eq!(event.subject(), "pipeline.job.sent");

        let event = PipelineEvent::CampaignRunCompleted {
            campaign_run_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            status: "completed".to_string(),
            total_recipients: 3,
            sent_count: 3,
            failed_count: 0,
            skipped_count: 0,
        };
        assert_eq!(event.subject(), "pipeline.campaign_run.completed");
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = PipelineEvent::JobRetrying {
            job_id: Uuid::new_v4(),
            retry_count: 2,
            next_attempt_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_retrying");
        assert_eq!(json["retry_count"], 2);
    }

    #[test]
    fn events_round_trip() {
        let event = PipelineEvent::JobDead {
            job_id: Uuid::new_v4(),
            total_attempts: 3,
            final_error: "provider rejected".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.subject(), "pipeline.job.dead");
    }

    #[test]
    fn outbound_wraps_subject_and_payload() {
        let tenant = Uuid::new_v4();
        let outbound = PipelineEvent::JobStarted {
            job_id: Uuid::new_v4(),
            attempt: 1,
        }
        .outbound(tenant, "corr-9");
        assert_eq!(outbound.subject, "pipeline.job.started");
        assert_eq!(outbound.tenant_id, tenant);
        assert_eq!(outbound.correlation_id, "corr-9");
        assert_eq!(outbound.payload["type"], "job_started");
    }
}
