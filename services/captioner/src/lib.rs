//! Caption Worker
//!
//! Out-of-process caption producer for the caption gallery platform. It
//! consumes the upload events published by the gallery service in deferred
//! mode, fetches each image from S3, asks the caption model for a caption
//! and writes it into the still-pending record.
//!
//! Delivery is at-least-once. Redelivered events find the record already
//! captioned and are acknowledged without another model call.

pub mod config;
pub mod consumer;

pub use config::{ConsumerConfig, WorkerConfig};
pub use consumer::{decode_event, CaptionHandler, ConsumerError, HandleOutcome, UploadEventConsumer};
