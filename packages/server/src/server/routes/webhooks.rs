//! Provider event webhook entrypoint.
//!
//! Accepts a JSON array of provider events. Signature failures are the only
//! rejection after parsing: processing errors are counted internally and the
//! endpoint still answers 200, so the provider does not build a retry storm.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;

use crate::domains::pipeline::reconciler::{Applied, ProviderEvent};
use crate::server::app::AppState;

const SIGNATURE_HEADER: &str = "x-webhook-signature";
const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// POST /webhooks/email
pub async fn email_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    // Signature check runs over the raw body, before any parsing.
    if state.verifier.is_configured() {
        let signature = header_str(&headers, SIGNATURE_HEADER);
        let timestamp = header_str(&headers, TIMESTAMP_HEADER);
        let verified = match (signature, timestamp) {
            (Some(signature), Some(timestamp)) => {
                state.verifier.verify(timestamp, &body, signature)
            }
            _ => false,
        };
        if !verified {
            tracing::warn!("webhook signature verification failed");
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "invalid signature"})),
            );
        }
    } else {
        tracing::warn!("webhook verification key not configured, accepting unsigned events");
    }

    let events: Vec<ProviderEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid payload: {e}")})),
            );
        }
    };

    if events.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "empty event array"})),
        );
    }

    let mut processed = 0usize;
    let mut errors = 0usize;
    for event in &events {
        match state.reconciler.apply_event(event).await {
            Ok(Applied::Ignored) => {}
            Ok(_) => processed += 1,
            Err(e) => {
                errors += 1;
                tracing::error!(
                    event = %event.event,
                    error = %e,
                    "failed to apply provider event"
                );
            }
        }
    }

    tracing::debug!(
        total = events.len(),
        processed,
        errors,
        "processed provider webhook batch"
    );

    (StatusCode::OK, Json(json!({"ok": true})))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
