//! Event bus publishing.
//!
//! Every pipeline component reports lifecycle facts to the named event bus.
//! Publishing is fire-and-forget: a failed publish is logged and never
//! propagated to the caller, because bus availability must not affect job
//! processing.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::nats::NatsPublisher;

/// Envelope version stamped on every event.
const EVENT_VERSION: u16 = 1;

/// Event source identifier for this service.
const EVENT_SOURCE: &str = "pipeline";

/// How many events are pushed to the bus per publish cycle when a batch is
/// emitted (job.created floods are chunked at this size).
pub const PUBLISH_BATCH_SIZE: usize = 100;

/// Wire envelope shared by all pipeline events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub tenant_id: Uuid,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: u16,
    pub source: String,
    pub payload: serde_json::Value,
}

/// An event ready for publishing: a bus subject plus its payload.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub subject: String,
    pub tenant_id: Uuid,
    pub correlation_id: String,
    pub payload: serde_json::Value,
}

/// Shared publisher handed to every pipeline component.
#[derive(Clone)]
pub struct EventPublisher {
    nats: Arc<dyn NatsPublisher>,
}

impl EventPublisher {
    pub fn new(nats: Arc<dyn NatsPublisher>) -> Self {
        Self { nats }
    }

    /// Publish a single event. Failures are logged, never returned.
    pub async fn publish(&self, event: OutboundEvent) {
        let envelope = EventEnvelope {
            event_id: Uuid::now_v7(),
            tenant_id: event.tenant_id,
            correlation_id: event.correlation_id,
            timestamp: Utc::now(),
            version: EVENT_VERSION,
            source: EVENT_SOURCE.to_string(),
            payload: event.payload,
        };

        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(subject = %event.subject, error = %e, "failed to serialize event");
                return;
            }
        };

        if let Err(e) = self
            .nats
            .publish(event.subject.clone(), Bytes::from(bytes))
            .await
        {
            tracing::warn!(subject = %event.subject, error = %e, "failed to publish event");
        }
    }

    /// Publish a batch of events in chunks of [`PUBLISH_BATCH_SIZE`],
    /// yielding between chunks so a large fan-out does not flood the bus.
    pub async fn publish_batch(&self, events: Vec<OutboundEvent>) {
        for chunk in events.chunks(PUBLISH_BATCH_SIZE) {
            for event in chunk {
                self.publish(event.clone()).await;
            }
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::nats::TestNats;

    fn event(subject: &str) -> OutboundEvent {
        OutboundEvent {
            subject: subject.to_string(),
            tenant_id: Uuid::new_v4(),
            correlation_id: "corr-1".to_string(),
            payload: serde_json::json!({"job_id": "j1"}),
        }
    }

    #[tokio::test]
    async fn envelope_carries_version_and_source() {
        let nats = Arc::new(TestNats::new());
        let publisher = EventPublisher::new(nats.clone());

        publisher.publish(event("pipeline.job.created")).await;

        let published = nats.published();
        assert_eq!(published.len(), 1);
        let envelope: EventEnvelope = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(envelope.version, 1);
        assert_eq!(envelope.source, "pipeline");
        assert_eq!(envelope.correlation_id, "corr-1");
        assert_eq!(envelope.payload["job_id"], "j1");
    }

    #[tokio::test]
    async fn batch_publish_delivers_every_event() {
        let nats = Arc::new(TestNats::new());
        let publisher = EventPublisher::new(nats.clone());

        let events = (0..250)
            .map(|_| event("pipeline.job.created"))
            .collect::<Vec<_>>();
        publisher.publish_batch(events).await;

        assert_eq!(nats.count_for("pipeline.job.created"), 250);
    }
}
