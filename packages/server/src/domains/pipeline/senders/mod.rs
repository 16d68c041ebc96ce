//! Channel senders: one capability per outbound channel, selected from a
//! registry keyed by [`Channel`].

pub mod email;
pub mod push;
pub mod sms;
pub mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::domains::templates::Content;

use super::error::PipelineError;
use super::models::Channel;

pub use email::EmailSender;
pub use push::PushSender;
pub use sms::SmsSender;
pub use whatsapp::WhatsAppSender;

/// Result of a recipient validity check.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    pub error: Option<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Correlation metadata threaded through every provider call.
#[derive(Debug, Clone)]
pub struct SendMetadata {
    pub tenant_id: Uuid,
    pub correlation_id: String,
    pub campaign_id: Uuid,
    pub job_id: Uuid,
    pub contact_id: Uuid,
}

/// Outcome of a dispatch attempt.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub retryable: bool,
}

impl SendOutcome {
    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
            retryable: false,
        }
    }

    pub fn failed(error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            provider_message_id: None,
            error: Some(error.into()),
            retryable,
        }
    }
}

/// A channel-specific message dispatcher.
///
/// `send` never returns `Err`: transport and provider failures are folded
/// into the outcome together with their retryability, so the worker has one
/// decision point.
#[async_trait]
pub trait ChannelSender: Send + Sync + std::fmt::Debug {
    fn channel(&self) -> Channel;

    fn validate_recipient(&self, recipient: &str) -> Validation;

    async fn send(&self, recipient: &str, content: &Content, meta: &SendMetadata) -> SendOutcome;
}

/// Registry of senders keyed by channel.
#[derive(Default)]
pub struct SenderRegistry {
    senders: HashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(sender.channel(), sender);
    }

    pub fn get(&self, channel: Channel) -> Result<Arc<dyn ChannelSender>, PipelineError> {
        self.senders
            .get(&channel)
            .cloned()
            .ok_or_else(|| PipelineError::ChannelNotSupported(channel.to_string()))
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.senders.keys().copied().collect()
    }
}

lazy_static! {
    // Practical grammar: local@domain, no whitespace, dot somewhere in the
    // domain. Deliverability is the provider's problem, not ours.
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid");
}

/// Shared practical email check used by the email sender.
pub fn is_valid_email(address: &str) -> bool {
    EMAIL_RE.is_match(address)
}

/// Map HTTP status to retryability: rate limits and server errors are worth
/// another attempt, other client errors are not.
pub(crate) fn status_retryable(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 429 || status.is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_grammar_accepts_practical_addresses() {
        assert!(is_valid_email("ada@example.com"));
        assert!(is_valid_email("first.last+tag@mail.example.co"));
    }

    #[test]
    fn email_grammar_rejects_malformed_addresses() {
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("missing@domain"));
        assert!(!is_valid_email("two words@example.com"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ada@"));
    }

    #[test]
    fn registry_rejects_unregistered_channels() {
        let registry = SenderRegistry::new();
        let err = registry.get(Channel::Email).unwrap_err();
        assert!(matches!(err, PipelineError::ChannelNotSupported(_)));
    }

    #[test]
    fn retryable_statuses() {
        assert!(status_retryable(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(status_retryable(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!status_retryable(reqwest::StatusCode::BAD_REQUEST));
        assert!(!status_retryable(reqwest::StatusCode::FORBIDDEN));
    }
}
