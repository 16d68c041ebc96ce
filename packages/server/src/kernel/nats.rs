//! NATS client abstraction for production and testing.
//!
//! Provides a trait-based NATS implementation that allows swapping between
//! real NATS connections, a log-only publisher for environments without a
//! bus, and a recording mock for tests.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::RwLock;

/// A published message.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Trait for NATS publish operations.
///
/// This allows swapping between real NATS and test mocks.
#[async_trait]
pub trait NatsPublisher: Send + Sync {
    /// Publish a message to a subject.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()>;
}

/// Real NATS client publisher.
pub struct NatsClientPublisher {
    client: async_nats::Client,
}

impl NatsClientPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NatsPublisher for NatsClientPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.client.publish(subject, payload).await?;
        Ok(())
    }
}

/// Publisher used when no bus is configured: events are logged at debug
/// level and dropped.
#[derive(Default)]
pub struct LoggingPublisher;

#[async_trait]
impl NatsPublisher for LoggingPublisher {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        tracing::debug!(
            subject = %subject,
            bytes = payload.len(),
            "event bus not configured, dropping event"
        );
        Ok(())
    }
}

/// Mock NATS client that tracks published messages for testing.
///
/// This allows tests to inspect what messages would have been published
/// to NATS without requiring a real connection.
#[derive(Default)]
pub struct TestNats {
    published: RwLock<Vec<PublishedMessage>>,
}

impl TestNats {
    /// Create a new test NATS client.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Messages published to an exact subject.
    pub fn published_to(&self, subject: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.subject == subject)
            .collect()
    }

    /// Count of messages published to an exact subject.
    pub fn count_for(&self, subject: &str) -> usize {
        self.published_to(subject).len()
    }
}

#[async_trait]
impl NatsPublisher for TestNats {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<()> {
        self.published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage { subject, payload });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nats_records_published_messages() {
        let nats = TestNats::new();
        nats.publish("pipeline.job.sent".to_string(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        nats.publish("pipeline.job.sent".to_string(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        nats.publish("pipeline.job.dead".to_string(), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(nats.published().len(), 3);
        assert_eq!(nats.count_for("pipeline.job.sent"), 2);
        assert_eq!(nats.count_for("pipeline.job.dead"), 1);
        assert_eq!(nats.count_for("pipeline.job.created"), 0);
    }
}
