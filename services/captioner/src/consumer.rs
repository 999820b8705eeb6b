//! Upload event consumer.
//!
//! Reads [`ImageUploadedEvent`]s from Kafka and hands each one to the
//! [`CaptionProducer`]. Offsets are committed after every message whatever
//! the outcome: a failed caption leaves the record pending rather than
//! blocking the partition.

use crate::config::ConsumerConfig;
use futures::StreamExt;
use gallery_service::{CaptionProducer, CaptionUpdate, ImageUploadedEvent};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while consuming upload events
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topic {topic}: {message}")]
    SubscriptionError { topic: String, message: String },

    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),
}

/// What happened to one consumed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// A caption was written into a pending record
    Captioned,
    /// The record already had a caption; nothing was written
    AlreadyCaptioned,
    /// No record exists for the event's key
    NoRecord,
    /// Caption generation or a store call failed; the record stays pending
    Failed,
    /// The payload was not an upload event
    Skipped,
}

impl HandleOutcome {
    fn label(self) -> &'static str {
        match self {
            HandleOutcome::Captioned => "captioned",
            HandleOutcome::AlreadyCaptioned => "already_captioned",
            HandleOutcome::NoRecord => "no_record",
            HandleOutcome::Failed => "failed",
            HandleOutcome::Skipped => "skipped",
        }
    }
}

/// Decode a message payload into an upload event
pub fn decode_event(payload: Option<&[u8]>) -> Result<ImageUploadedEvent, ConsumerError> {
    let payload = payload
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConsumerError::DeserializationError("empty payload".to_string()))?;

    serde_json::from_slice(payload).map_err(|e| ConsumerError::DeserializationError(e.to_string()))
}

/// Turns upload events into caption writes.
#[derive(Clone)]
pub struct CaptionHandler {
    producer: CaptionProducer,
}

impl CaptionHandler {
    pub fn new(producer: CaptionProducer) -> Self {
        Self { producer }
    }

    /// Handle one raw message payload. Never fails: every outcome is
    /// logged and counted, and the caller commits regardless.
    pub async fn handle(&self, payload: Option<&[u8]>) -> HandleOutcome {
        let outcome = match decode_event(payload) {
            Ok(event) => self.caption(&event).await,
            Err(e) => {
                warn!(error = %e, "Skipping malformed upload event");
                HandleOutcome::Skipped
            }
        };

        metrics::counter!("captioner.events.handled", "outcome" => outcome.label()).increment(1);
        outcome
    }

    #[instrument(skip(self, event), fields(image_key = %event.image_key, event_id = %event.event_id))]
    async fn caption(&self, event: &ImageUploadedEvent) -> HandleOutcome {
        let start = std::time::Instant::now();

        match self.producer.produce(&event.image_key, None).await {
            Ok(CaptionUpdate::Applied) => {
                metrics::counter!("captioner.captions.applied").increment(1);
                metrics::histogram!("captioner.caption.duration_seconds")
                    .record(start.elapsed().as_secs_f64());
                info!("Caption attached");
                HandleOutcome::Captioned
            }
            Ok(CaptionUpdate::AlreadySet) => {
                debug!("Record already captioned");
                HandleOutcome::AlreadyCaptioned
            }
            Ok(CaptionUpdate::Missing) => {
                warn!("Upload event for a key with no record");
                HandleOutcome::NoRecord
            }
            Err(e) => {
                metrics::counter!("captioner.captions.failed", "code" => e.code()).increment(1);
                error!(error = %e, "Caption failed, record stays pending");
                HandleOutcome::Failed
            }
        }
    }
}

/// Kafka consumer for the upload topic
pub struct UploadEventConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl UploadEventConsumer {
    /// Create a consumer and subscribe it to the upload topic
    pub fn new(config: &ConsumerConfig) -> Result<Self, ConsumerError> {
        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        consumer
            .subscribe(&[config.upload_topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError {
                topic: config.upload_topic.clone(),
                message: e.to_string(),
            })?;

        info!(
            topic = %config.upload_topic,
            group_id = %config.group_id,
            brokers = %config.bootstrap_servers,
            "Upload event consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.upload_topic.clone(),
        })
    }

    /// Consume until `shutdown` is cancelled or the stream ends
    pub async fn run(
        &self,
        handler: &CaptionHandler,
        shutdown: CancellationToken,
    ) -> Result<(), ConsumerError> {
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        info!(topic = %self.topic, "Starting caption consumption loop");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal");
                    break;
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(message)) => {
                            debug!(
                                partition = message.partition(),
                                offset = message.offset(),
                                "Received upload event"
                            );

                            handler.handle(message.payload()).await;

                            if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                                warn!(error = %e, "Failed to commit offset");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        None => {
                            debug!("Stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .or_else(|e| match e {
                // Nothing consumed since the last commit
                rdkafka::error::KafkaError::ConsumerCommit(
                    rdkafka::types::RDKafkaErrorCode::NoOffset,
                ) => Ok(()),
                e => Err(ConsumerError::CommitError(e.to_string())),
            })
    }
}
