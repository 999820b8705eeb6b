//! Upload events: the external trigger of deferred captioning.
//!
//! The gallery service publishes one [`ImageUploadedEvent`] per upload after
//! the record exists; the caption worker consumes them. Delivery is
//! at-least-once, which the caption producer tolerates by only ever writing
//! a caption into a pending record.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Message type header value carried by upload events
pub const IMAGE_UPLOADED: &str = "image_uploaded";

/// Errors that can occur while publishing upload events
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    #[error("Failed to send event to topic {topic}: {message}")]
    SendError { topic: String, message: String },
}

/// Announces that an image and its pending record now exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUploadedEvent {
    /// Unique event ID
    pub event_id: Uuid,
    /// Object key, also the record key
    pub image_key: String,
    /// MIME type of the stored object
    pub content_type: String,
    /// Object size in bytes
    pub size_bytes: u64,
    /// Record upload time
    pub uploaded_at: DateTime<Utc>,
}

impl ImageUploadedEvent {
    pub fn new(
        image_key: impl Into<String>,
        content_type: impl Into<String>,
        size_bytes: u64,
        uploaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            image_key: image_key.into(),
            content_type: content_type.into(),
            size_bytes,
            uploaded_at,
        }
    }
}

/// Transport for upload events.
#[async_trait]
pub trait UploadNotifier: Send + Sync + 'static {
    async fn notify(&self, event: &ImageUploadedEvent) -> Result<(), EventError>;
}

/// Kafka publisher for upload events, keyed by image key.
pub struct KafkaUploadNotifier {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaUploadNotifier {
    /// Create a new notifier with the given configuration
    pub fn new(config: &KafkaConfig) -> Result<Self, EventError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all");

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| EventError::CreationError(e.to_string()))?;

        info!(
            topic = %config.upload_topic,
            brokers = %config.bootstrap_servers,
            "Kafka upload notifier initialized"
        );

        Ok(Self {
            producer,
            topic: config.upload_topic.clone(),
            timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl UploadNotifier for KafkaUploadNotifier {
    #[instrument(skip(self, event), fields(image_key = %event.image_key, event_id = %event.event_id))]
    async fn notify(&self, event: &ImageUploadedEvent) -> Result<(), EventError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| EventError::SerializationError(e.to_string()))?;

        let headers = OwnedHeaders::new().insert(Header {
            key: "message-type",
            value: Some(IMAGE_UPLOADED),
        });

        let record = FutureRecord::to(&self.topic)
            .key(&event.image_key)
            .payload(&payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| EventError::SendError {
                topic: self.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Upload event delivered");

        Ok(())
    }
}

impl Drop for KafkaUploadNotifier {
    fn drop(&mut self) {
        info!("Shutting down Kafka upload notifier");
        if let Err(e) = self.producer.flush(Timeout::After(Duration::from_secs(5))) {
            warn!(error = %e, "Failed to flush notifier on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_image_uploaded_event() {
        let json = r#"{
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "image_key": "cat.png",
            "content_type": "image/png",
            "size_bytes": 2048,
            "uploaded_at": "2024-01-15T10:30:00Z"
        }"#;

        let event: ImageUploadedEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.image_key, "cat.png");
        assert_eq!(event.size_bytes, 2048);
    }

    #[test]
    fn test_new_event_has_fresh_id() {
        let now = Utc::now();
        let a = ImageUploadedEvent::new("cat.png", "image/png", 3, now);
        let b = ImageUploadedEvent::new("cat.png", "image/png", 3, now);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.image_key, b.image_key);
    }
}
