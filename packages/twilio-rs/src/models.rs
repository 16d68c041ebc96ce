use serde::Deserialize;

/// A created message resource, as returned by `POST /Messages.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageResponse {
    pub sid: String,
    pub status: String,
    pub to: String,
    pub from: Option<String>,
    pub error_code: Option<i64>,
    pub error_message: Option<String>,
}

/// Error body returned by the Twilio REST API.
#[derive(Debug, Clone, Deserialize)]
pub struct TwilioApiError {
    pub code: Option<i64>,
    pub message: String,
    pub status: Option<u16>,
}
