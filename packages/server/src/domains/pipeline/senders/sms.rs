//! Twilio SMS sender.

use std::sync::Arc;

use async_trait::async_trait;
use twilio::TwilioService;

use crate::domains::pipeline::models::Channel;
use crate::domains::templates::Content;

use super::{ChannelSender, SendMetadata, SendOutcome, Validation};

#[derive(Debug)]
pub struct SmsSender {
    twilio: Arc<TwilioService>,
    from_number: String,
}

impl SmsSender {
    pub fn new(twilio: Arc<TwilioService>, from_number: String) -> Self {
        Self {
            twilio,
            from_number,
        }
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn validate_recipient(&self, recipient: &str) -> Validation {
        if recipient.trim().is_empty() {
            Validation::invalid("phone number is empty")
        } else {
            Validation::ok()
        }
    }

    async fn send(&self, recipient: &str, content: &Content, meta: &SendMetadata) -> SendOutcome {
        let Content::Sms { body, sender_id } = content else {
            return SendOutcome::failed("sms sender received non-sms content", false);
        };

        let from = sender_id.as_deref().unwrap_or(&self.from_number);
        match self.twilio.send_sms(from, recipient, body).await {
            Ok(message) => SendOutcome::sent(message.sid),
            Err(e) => {
                tracing::warn!(job_id = %meta.job_id, error = %e, "twilio sms send failed");
                let retryable = e.is_retryable();
                SendOutcome::failed(e.to_string(), retryable)
            }
        }
    }
}
