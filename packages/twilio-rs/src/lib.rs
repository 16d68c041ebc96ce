// https://www.twilio.com/docs/messaging/api/message-resource

use std::collections::HashMap;

pub mod models;

use reqwest::{header, Client};

use crate::models::MessageResponse;

#[derive(Debug, thiserror::Error)]
pub enum TwilioError {
    #[error("twilio api error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse twilio response: {0}")]
    Parse(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl TwilioError {
    /// Whether the failure is worth retrying (rate limits and server errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            TwilioError::Api { status, .. } => *status == 429 || *status >= 500,
            TwilioError::Parse(_) => false,
            TwilioError::Http(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TwilioOptions {
    pub account_sid: String,
    pub auth_token: String,
}

/// Thin client for the Twilio Messages API.
///
/// One `TwilioService` is shared by the SMS and WhatsApp senders; WhatsApp
/// messages are regular Messages API posts with `whatsapp:`-prefixed
/// addresses.
#[derive(Debug, Clone)]
pub struct TwilioService {
    options: TwilioOptions,
    client: Client,
}

impl TwilioService {
    pub fn new(options: TwilioOptions) -> Self {
        Self {
            options,
            client: Client::new(),
        }
    }

    /// Send an SMS message. Returns the created message resource, whose
    /// `sid` identifies the message in later status callbacks.
    pub async fn send_sms(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<MessageResponse, TwilioError> {
        self.send_message(from, to, body).await
    }

    /// Send a WhatsApp message via the Messages API.
    ///
    /// Addresses are prefixed with `whatsapp:` unless the caller already
    /// provided the prefix.
    pub async fn send_whatsapp(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<MessageResponse, TwilioError> {
        let from = ensure_whatsapp_prefix(from);
        let to = ensure_whatsapp_prefix(to);
        self.send_message(&from, &to, body).await
    }

    async fn send_message(
        &self,
        from: &str,
        to: &str,
        body: &str,
    ) -> Result<MessageResponse, TwilioError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{sid}/Messages.json",
            sid = self.options.account_sid
        );

        let mut headers = header::HeaderMap::new();
        headers.insert(
            "Content-Type",
            "application/x-www-form-urlencoded"
                .parse()
                .expect("Header value should parse correctly"),
        );

        let mut form_body: HashMap<&str, &str> = HashMap::new();
        form_body.insert("From", from);
        form_body.insert("To", to);
        form_body.insert("Body", body);

        let response = self
            .client
            .post(url)
            .basic_auth(
                &self.options.account_sid,
                Some(&self.options.auth_token),
            )
            .headers(headers)
            .form(&form_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<models::TwilioApiError>(&error_body)
                .map(|e| e.message)
                .unwrap_or(error_body);
            tracing::warn!(status = status.as_u16(), %message, "twilio message rejected");
            return Err(TwilioError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<MessageResponse>()
            .await
            .map_err(|e| TwilioError::Parse(e.to_string()))
    }
}

fn ensure_whatsapp_prefix(address: &str) -> String {
    if address.starts_with("whatsapp:") {
        address.to_string()
    } else {
        format!("whatsapp:{address}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whatsapp_prefix_added_once() {
        assert_eq!(ensure_whatsapp_prefix("+15551234567"), "whatsapp:+15551234567");
        assert_eq!(
            ensure_whatsapp_prefix("whatsapp:+15551234567"),
            "whatsapp:+15551234567"
        );
    }

    #[test]
    fn api_errors_retryable_by_status() {
        let rate_limited = TwilioError::Api {
            status: 429,
            message: "Too Many Requests".to_string(),
        };
        assert!(rate_limited.is_retryable());

        let bad_number = TwilioError::Api {
            status: 400,
            message: "Invalid 'To' Phone Number".to_string(),
        };
        assert!(!bad_number.is_retryable());

        let server_error = TwilioError::Api {
            status: 503,
            message: "Service Unavailable".to_string(),
        };
        assert!(server_error.is_retryable());
    }
}
