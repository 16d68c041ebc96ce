//! Expo push notification sender.
//!
//! Device tokens come from the contact attribute `push_token`, resolved by
//! the producer into the job payload address.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::domains::pipeline::models::Channel;
use crate::domains::templates::Content;

use super::{status_retryable, ChannelSender, SendMetadata, SendOutcome, Validation};

const EXPO_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

#[derive(Debug, Serialize)]
struct ExpoMessage {
    to: String,
    title: String,
    body: String,
    data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    sound: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExpoResponse {
    data: Vec<ExpoTicket>,
}

#[derive(Debug, Deserialize)]
struct ExpoTicket {
    status: String,
    id: Option<String>,
    message: Option<String>,
    details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct PushSender {
    client: Client,
    access_token: Option<String>,
}

impl PushSender {
    pub fn new(access_token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            access_token,
        }
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn validate_recipient(&self, recipient: &str) -> Validation {
        if recipient.trim().is_empty() {
            Validation::invalid("device token is empty")
        } else {
            Validation::ok()
        }
    }

    async fn send(&self, recipient: &str, content: &Content, meta: &SendMetadata) -> SendOutcome {
        let Content::Push {
            title,
            body,
            image_url,
            action_url,
        } = content
        else {
            return SendOutcome::failed("push sender received non-push content", false);
        };

        let message = ExpoMessage {
            to: recipient.to_string(),
            title: title.clone(),
            body: body.clone(),
            data: serde_json::json!({
                "campaign_id": meta.campaign_id,
                "correlation_id": meta.correlation_id,
                "image_url": image_url,
                "action_url": action_url,
            }),
            sound: Some("default".to_string()),
        };

        let mut request = self.client.post(EXPO_PUSH_URL).json(&message);
        if let Some(token) = &self.access_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return SendOutcome::failed(format!("expo request failed: {e}"), true),
        };

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                job_id = %meta.job_id,
                "expo push rejected"
            );
            return SendOutcome::failed(
                format!("expo push error {status}: {error_body}"),
                status_retryable(status),
            );
        }

        let expo_response: ExpoResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => return SendOutcome::failed(format!("expo response parse failed: {e}"), false),
        };

        match expo_response.data.into_iter().next() {
            Some(ticket) if ticket.status == "ok" => match ticket.id {
                Some(id) => SendOutcome::sent(id),
                None => SendOutcome::failed("expo ticket missing id", false),
            },
            Some(ticket) => {
                let detail_error = ticket
                    .details
                    .as_ref()
                    .and_then(|d| d.get("error"))
                    .and_then(|e| e.as_str())
                    .unwrap_or_default()
                    .to_string();
                // DeviceNotRegistered never recovers; treat other ticket
                // errors (e.g. rate limiting) as transient.
                let retryable = detail_error != "DeviceNotRegistered";
                SendOutcome::failed(
                    ticket
                        .message
                        .unwrap_or_else(|| format!("expo ticket error: {detail_error}")),
                    retryable,
                )
            }
            None => SendOutcome::failed("expo response contained no tickets", false),
        }
    }
}
