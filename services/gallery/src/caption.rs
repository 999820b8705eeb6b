//! Caption acquisition.
//!
//! [`CaptionGenerator`] is the model; [`CaptionProducer`] turns a generated
//! caption into the one conditional write that completes a record; and
//! [`CaptionStrategy`] is what the upload path sees, with an inline and a
//! deferred implementation selected from configuration.

use crate::config::{CaptionMode, GeminiConfig};
use crate::error::{Error, Result};
use crate::events::{ImageUploadedEvent, UploadNotifier};
use crate::object_store::{content_type_for, ObjectStore};
use crate::records::{CaptionUpdate, RecordLifecycle};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Produces a descriptive caption for an image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptionGenerator: Send + Sync + 'static {
    /// Caption `image`. Fails with [`Error::CaptionGeneration`] on model or
    /// transport errors, timeouts, and empty responses.
    async fn generate(&self, image: &[u8], content_type: &str) -> Result<String>;
}

/// Caption generator backed by the Gemini `generateContent` API
pub struct GeminiCaptioner {
    client: reqwest::Client,
    config: GeminiConfig,
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    InlineData { inline_data: InlineData<'a> },
    Text { text: &'a str },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate, if any.
    fn caption(self) -> Option<String> {
        let text: String = self
            .candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect();

        let text = text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

impl GeminiCaptioner {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::CaptionGeneration(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl CaptionGenerator for GeminiCaptioner {
    #[instrument(skip(self, image), fields(model = %self.config.model, size_bytes = image.len()))]
    async fn generate(&self, image: &[u8], content_type: &str) -> Result<String> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    RequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type: content_type,
                            data: STANDARD.encode(image),
                        },
                    },
                    RequestPart::Text {
                        text: &self.config.prompt,
                    },
                ],
            }],
        };

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::CaptionGeneration(format!("model request timed out: {e}"))
                } else {
                    Error::CaptionGeneration(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::CaptionGeneration(format!(
                "model returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| Error::CaptionGeneration(format!("malformed model response: {e}")))?;

        body.caption()
            .ok_or_else(|| Error::CaptionGeneration("model returned no caption".to_string()))
    }
}

/// Completes pending records with a generated caption.
///
/// Safe under at-least-once invocation: an already captioned record is left
/// alone without calling the model, and the final write only lands on a
/// record that is still pending.
#[derive(Clone)]
pub struct CaptionProducer {
    lifecycle: RecordLifecycle,
    objects: Arc<dyn ObjectStore>,
    generator: Arc<dyn CaptionGenerator>,
}

impl CaptionProducer {
    pub fn new(
        lifecycle: RecordLifecycle,
        objects: Arc<dyn ObjectStore>,
        generator: Arc<dyn CaptionGenerator>,
    ) -> Self {
        Self {
            lifecycle,
            objects,
            generator,
        }
    }

    /// Caption the record stored under `image_key`.
    ///
    /// `image` may carry the bytes when the caller already has them;
    /// otherwise they are fetched from the object store.
    #[instrument(skip(self, image), fields(image_key = %image_key))]
    pub async fn produce(&self, image_key: &str, image: Option<&[u8]>) -> Result<CaptionUpdate> {
        let record = match self.lifecycle.get(image_key).await? {
            Some(record) => record,
            None => {
                warn!(image_key = %image_key, "No record for caption request");
                return Ok(CaptionUpdate::Missing);
            }
        };

        if record.caption.is_some() {
            debug!(image_key = %image_key, "Record already captioned, skipping model call");
            return Ok(CaptionUpdate::AlreadySet);
        }

        let fetched;
        let data = match image {
            Some(data) => data,
            None => {
                fetched = self.objects.get(image_key).await?.ok_or_else(|| {
                    Error::StorageRead(format!("object {image_key} is missing from the store"))
                })?;
                fetched.as_slice()
            }
        };

        let content_type = content_type_for(extension_of(image_key));
        let caption = self.generator.generate(data, content_type).await?;

        self.lifecycle.attach_caption(image_key, &caption).await
    }
}

/// What the upload path hands to the caption strategy.
#[derive(Debug, Clone, Copy)]
pub struct UploadedImage<'a> {
    pub image_key: &'a str,
    pub data: &'a [u8],
    pub content_type: &'a str,
    pub uploaded_at: DateTime<Utc>,
}

/// Caption acquisition as seen by the upload coordinator.
///
/// The coordinator calls both hooks for every upload and never branches on
/// the mode itself.
#[async_trait]
pub trait CaptionStrategy: Send + Sync + 'static {
    fn mode(&self) -> CaptionMode;

    /// Called after the object write and before the record insert. A
    /// returned caption is stored with the new record.
    async fn caption_before_insert(&self, _image: &UploadedImage<'_>) -> Result<Option<String>> {
        Ok(None)
    }

    /// Called once the record exists.
    async fn after_insert(&self, _image: &UploadedImage<'_>) -> Result<()> {
        Ok(())
    }
}

/// Captions synchronously inside the upload request.
pub struct InlineCaptioning {
    generator: Arc<dyn CaptionGenerator>,
}

impl InlineCaptioning {
    pub fn new(generator: Arc<dyn CaptionGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl CaptionStrategy for InlineCaptioning {
    fn mode(&self) -> CaptionMode {
        CaptionMode::Inline
    }

    async fn caption_before_insert(&self, image: &UploadedImage<'_>) -> Result<Option<String>> {
        let caption = self
            .generator
            .generate(image.data, image.content_type)
            .await?;
        info!(image_key = %image.image_key, "Inline caption generated");
        Ok(Some(caption))
    }
}

/// Leaves the record pending and publishes an upload event for the worker.
pub struct DeferredCaptioning {
    notifier: Arc<dyn UploadNotifier>,
}

impl DeferredCaptioning {
    pub fn new(notifier: Arc<dyn UploadNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl CaptionStrategy for DeferredCaptioning {
    fn mode(&self) -> CaptionMode {
        CaptionMode::Deferred
    }

    async fn after_insert(&self, image: &UploadedImage<'_>) -> Result<()> {
        let event = ImageUploadedEvent::new(
            image.image_key,
            image.content_type,
            image.data.len() as u64,
            image.uploaded_at,
        );

        self.notifier
            .notify(&event)
            .await
            .map_err(|e| Error::CaptionGeneration(format!("failed to schedule caption: {e}")))?;

        debug!(image_key = %image.image_key, event_id = %event.event_id, "Caption scheduled");
        Ok(())
    }
}

/// Extension of a key, without the dot. Empty when there is none.
pub fn extension_of(key: &str) -> &str {
    key.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}
