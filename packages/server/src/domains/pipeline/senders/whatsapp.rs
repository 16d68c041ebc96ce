//! Twilio WhatsApp sender.

use std::sync::Arc;

use async_trait::async_trait;
use twilio::TwilioService;

use crate::domains::pipeline::models::Channel;
use crate::domains::templates::Content;

use super::{ChannelSender, SendMetadata, SendOutcome, Validation};

#[derive(Debug)]
pub struct WhatsAppSender {
    twilio: Arc<TwilioService>,
    from_address: String,
}

impl WhatsAppSender {
    pub fn new(twilio: Arc<TwilioService>, from_address: String) -> Self {
        Self {
            twilio,
            from_address,
        }
    }
}

#[async_trait]
impl ChannelSender for WhatsAppSender {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn validate_recipient(&self, recipient: &str) -> Validation {
        if recipient.trim().is_empty() {
            Validation::invalid("phone number is empty")
        } else {
            Validation::ok()
        }
    }

    async fn send(&self, recipient: &str, content: &Content, meta: &SendMetadata) -> SendOutcome {
        let Content::Whatsapp { body, .. } = content else {
            return SendOutcome::failed("whatsapp sender received non-whatsapp content", false);
        };

        match self
            .twilio
            .send_whatsapp(&self.from_address, recipient, body)
            .await
        {
            Ok(message) => SendOutcome::sent(message.sid),
            Err(e) => {
                tracing::warn!(job_id = %meta.job_id, error = %e, "twilio whatsapp send failed");
                let retryable = e.is_retryable();
                SendOutcome::failed(e.to_string(), retryable)
            }
        }
    }
}
