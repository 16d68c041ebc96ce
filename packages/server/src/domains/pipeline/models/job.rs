//! Pipeline job model: one row per recipient per campaign run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Job lifecycle states. Transitions between them are governed by the
/// transition table in [`crate::domains::pipeline::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Queued,
    Processing,
    Sent,
    Delivered,
    Failed,
    Retrying,
    Dead,
    Skipped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Sent,
        JobStatus::Delivered,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::Dead,
        JobStatus::Skipped,
    ];

    /// Terminal states have no outgoing edges. `Dead` is terminal-with-escape
    /// (an operator may requeue it) and is deliberately not listed here.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Delivered | JobStatus::Skipped)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Sent => "sent",
            JobStatus::Delivered => "delivered",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Dead => "dead",
            JobStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "sent" => Ok(JobStatus::Sent),
            "delivered" => Ok(JobStatus::Delivered),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "dead" => Ok(JobStatus::Dead),
            "skipped" => Ok(JobStatus::Skipped),
            _ => Err(anyhow::anyhow!("Invalid job status: {}", s)),
        }
    }
}

/// Outbound channel a job dispatches through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Email,
        Channel::Sms,
        Channel::Whatsapp,
        Channel::Push,
    ];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Whatsapp => "whatsapp",
            Channel::Push => "push",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "whatsapp" => Ok(Channel::Whatsapp),
            "push" => Ok(Channel::Push),
            _ => Err(anyhow::anyhow!("Invalid channel: {}", s)),
        }
    }
}

/// Why a job ended in `Skipped`. Skips are terminal non-failures: the
/// recipient could not be sent to for a well-understood reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingEmail,
    InvalidEmail,
    MissingPhone,
    InvalidPhone,
    Unsubscribed,
    ContactNotFound,
    TemplateError,
    DuplicateSend,
    Other,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::MissingEmail => "missing_email",
            SkipReason::InvalidEmail => "invalid_email",
            SkipReason::MissingPhone => "missing_phone",
            SkipReason::InvalidPhone => "invalid_phone",
            SkipReason::Unsubscribed => "unsubscribed",
            SkipReason::ContactNotFound => "contact_not_found",
            SkipReason::TemplateError => "template_error",
            SkipReason::DuplicateSend => "duplicate_send",
            SkipReason::Other => "other",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Payload
// ============================================================================

/// Structured payload composed by the producer: the address resolved for the
/// job's channel plus pass-through contact attributes for rendering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    /// Email address, phone number, or device token depending on channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl JobPayload {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct PipelineJob {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    // Ownership
    pub tenant_id: Uuid,
    pub campaign_id: Uuid,
    pub campaign_run_id: Uuid,
    pub contact_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub template_version_id: Option<Uuid>,

    pub channel: Channel,

    /// Rendered address and pass-through variables, see [`JobPayload`].
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub skip_reason: Option<SkipReason>,

    /// External identifier returned by the channel sender; unique per tenant
    /// when present, used by webhook reconciliation.
    #[builder(default, setter(strip_option))]
    pub provider_message_id: Option<String>,

    /// Opaque tracing id threaded from the producer through every event.
    #[builder(default, setter(strip_option))]
    pub correlation_id: Option<String>,

    // Per-state timestamps, stamped on every entry into the state
    #[builder(default, setter(strip_option))]
    pub queued_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub processing_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub sent_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub delivered_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub failed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub skipped_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl PipelineJob {
    /// The structured view of the payload column.
    pub fn payload(&self) -> JobPayload {
        JobPayload::from_value(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn channel_round_trips_through_strings() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_str(&channel.to_string()).unwrap(), channel);
        }
        assert!(Channel::from_str("carrier_pigeon").is_err());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn only_delivered_and_skipped_are_terminal() {
        let terminal: Vec<_> = JobStatus::ALL
            .into_iter()
            .filter(JobStatus::is_terminal)
            .collect();
        assert_eq!(terminal, vec![JobStatus::Delivered, JobStatus::Skipped]);
    }

    #[test]
    fn payload_round_trips() {
        let mut attributes = serde_json::Map::new();
        attributes.insert("plan".to_string(), serde_json::json!("pro"));
        let payload = JobPayload {
            address: Some("ada@example.com".to_string()),
            full_name: Some("Ada Lovelace".to_string()),
            attributes,
        };

        let restored = JobPayload::from_value(&payload.to_value());
        assert_eq!(restored.address.as_deref(), Some("ada@example.com"));
        assert_eq!(restored.full_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(restored.attributes["plan"], "pro");
    }

    #[test]
    fn builder_fills_defaults() {
        let job = PipelineJob::builder()
            .tenant_id(Uuid::new_v4())
            .campaign_id(Uuid::new_v4())
            .campaign_run_id(Uuid::new_v4())
            .contact_id(Uuid::new_v4())
            .channel(Channel::Email)
            .build();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.provider_message_id.is_none());
        assert!(job.queued_at.is_none());
    }
}
