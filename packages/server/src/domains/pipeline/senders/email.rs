//! SendGrid email sender.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::domains::pipeline::models::Channel;
use crate::domains::templates::Content;

use super::{is_valid_email, status_retryable, ChannelSender, SendMetadata, SendOutcome, Validation};

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";

#[derive(Debug)]
pub struct EmailSender {
    client: Client,
    api_key: String,
    from_email: String,
}

impl EmailSender {
    pub fn new(api_key: String, from_email: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            from_email,
        }
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn validate_recipient(&self, recipient: &str) -> Validation {
        if is_valid_email(recipient) {
            Validation::ok()
        } else {
            Validation::invalid(format!("not a valid email address: {recipient}"))
        }
    }

    async fn send(&self, recipient: &str, content: &Content, meta: &SendMetadata) -> SendOutcome {
        let Content::Email {
            subject,
            html_body,
            text_body,
        } = content
        else {
            return SendOutcome::failed("email sender received non-email content", false);
        };

        let mut contents = Vec::new();
        if let Some(text) = text_body {
            contents.push(json!({"type": "text/plain", "value": text}));
        }
        contents.push(json!({"type": "text/html", "value": html_body}));

        let body = json!({
            "personalizations": [{
                "to": [{"email": recipient}],
                "custom_args": {
                    "job_id": meta.job_id,
                    "campaign_id": meta.campaign_id,
                    "correlation_id": meta.correlation_id,
                }
            }],
            "from": {"email": self.from_email},
            "subject": subject,
            "content": contents,
        });

        let response = match self
            .client
            .post(SENDGRID_SEND_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SendOutcome::failed(format!("sendgrid request failed: {e}"), true),
        };

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                job_id = %meta.job_id,
                "sendgrid rejected message"
            );
            return SendOutcome::failed(
                format!("sendgrid error {status}: {error_body}"),
                status_retryable(status),
            );
        }

        match response
            .headers()
            .get("X-Message-Id")
            .and_then(|v| v.to_str().ok())
        {
            Some(message_id) => SendOutcome::sent(message_id),
            None => SendOutcome::failed("sendgrid response missing X-Message-Id", false),
        }
    }
}
