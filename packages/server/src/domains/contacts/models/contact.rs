use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A recipient contact. Owned by the upstream contact service; the pipeline
/// reads it to resolve addresses and appends timeline events.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    /// Free-form attributes (push token, template variables, segmentation).
    pub attributes: serde_json::Value,
    pub unsubscribed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Look up a string attribute, e.g. the push device token.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Kind of contact-timeline entry the pipeline records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    EmailBounced,
    EmailOpened,
    EmailClicked,
    ConsentUpdated,
}

impl std::fmt::Display for TimelineEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimelineEventKind::EmailBounced => "email_bounced",
            TimelineEventKind::EmailOpened => "email_opened",
            TimelineEventKind::EmailClicked => "email_clicked",
            TimelineEventKind::ConsentUpdated => "consent_updated",
        };
        write!(f, "{s}")
    }
}

/// Input for appending a timeline entry.
#[derive(Debug, Clone)]
pub struct NewTimelineEvent {
    pub tenant_id: Uuid,
    pub contact_id: Uuid,
    pub kind: TimelineEventKind,
    pub data: serde_json::Value,
}
