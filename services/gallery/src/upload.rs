use crate::caption::{extension_of, CaptionStrategy, UploadedImage};
use crate::error::{Error, Result};
use crate::object_store::{content_type_for, ObjectStore};
use crate::records::RecordLifecycle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Extensions accepted for upload
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// Result of an accepted upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    /// Key of the stored object and its record
    pub image_key: String,
    /// Presigned access URL, absent if signing failed after the upload
    pub url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
    /// Caption, present only when it was produced inline
    pub caption: Option<String>,
}

/// Validates, stores and records new uploads.
///
/// Ordering is the whole consistency story: the object is written first,
/// then the record, then the caption strategy is told the record exists.
/// A failed object write leaves nothing behind; a failed record write
/// leaves an unreferenced object, which is not rolled back.
#[derive(Clone)]
pub struct UploadCoordinator {
    objects: Arc<dyn ObjectStore>,
    lifecycle: RecordLifecycle,
    captions: Arc<dyn CaptionStrategy>,
    max_bytes: usize,
    url_ttl: Duration,
}

impl UploadCoordinator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        lifecycle: RecordLifecycle,
        captions: Arc<dyn CaptionStrategy>,
        max_bytes: usize,
        url_ttl: Duration,
    ) -> Self {
        Self {
            objects,
            lifecycle,
            captions,
            max_bytes,
            url_ttl,
        }
    }

    /// Accept an upload of `data` named `file_name`.
    #[instrument(skip(self, data), fields(file_name = %file_name, size_bytes = data.len(), mode = ?self.captions.mode()))]
    pub async fn upload(&self, file_name: &str, data: &[u8]) -> Result<UploadReceipt> {
        let image_key = match self.validate(file_name, data) {
            Ok(key) => key,
            Err(e) => {
                metrics::counter!("gallery.uploads.rejected").increment(1);
                return Err(e);
            }
        };
        let content_type = content_type_for(extension_of(&image_key));

        self.objects.put(&image_key, data, content_type).await.map_err(|e| {
            error!(image_key = %image_key, error = %e, "Object write failed, no record created");
            metrics::counter!("gallery.uploads.failed", "stage" => "storage").increment(1);
            e
        })?;

        let image = UploadedImage {
            image_key: &image_key,
            data,
            content_type,
            uploaded_at: Utc::now(),
        };

        let caption = match self.captions.caption_before_insert(&image).await {
            Ok(caption) => caption,
            Err(e) => {
                // The record is still created; it simply stays pending.
                warn!(image_key = %image_key, error = %e, "Inline caption failed");
                metrics::counter!("gallery.captions.failed").increment(1);
                None
            }
        };

        let record = self
            .lifecycle
            .create(&image_key, caption.as_deref(), image.uploaded_at)
            .await
            .map_err(|e| {
                error!(
                    image_key = %image_key,
                    error = %e,
                    "Record write failed after object write, object left unreferenced"
                );
                metrics::counter!("gallery.uploads.failed", "stage" => "metadata").increment(1);
                e
            })?;

        if let Err(e) = self.captions.after_insert(&image).await {
            error!(image_key = %image_key, error = %e, "Failed to schedule caption, record stays pending");
            metrics::counter!("gallery.captions.failed").increment(1);
        }

        let (url, expires_at) = match self.objects.presign_get(&image_key, self.url_ttl).await {
            Ok(presigned) => (Some(presigned.url), Some(presigned.expires_at)),
            Err(e) => {
                warn!(image_key = %image_key, error = %e, "Failed to presign new upload");
                (None, None)
            }
        };

        metrics::counter!("gallery.uploads.accepted").increment(1);
        metrics::counter!("gallery.bytes.uploaded").increment(data.len() as u64);

        info!(
            image_key = %image_key,
            captioned = record.caption.is_some(),
            "Upload accepted"
        );

        Ok(UploadReceipt {
            image_key: record.image_key,
            url,
            expires_at,
            uploaded_at: record.uploaded_at,
            caption: record.caption,
        })
    }

    /// Check the upload and derive its object key.
    fn validate(&self, file_name: &str, data: &[u8]) -> Result<String> {
        if file_name.trim().is_empty() {
            return Err(Error::Validation("no file selected".to_string()));
        }

        if !has_allowed_extension(file_name) {
            return Err(Error::Validation(format!(
                "invalid file type, allowed: {}",
                ALLOWED_EXTENSIONS.join(", ")
            )));
        }

        if data.is_empty() {
            return Err(Error::Validation("file is empty".to_string()));
        }

        if data.len() > self.max_bytes {
            return Err(Error::Validation(format!(
                "file exceeds {} bytes",
                self.max_bytes
            )));
        }

        let key = sanitize_filename(file_name);
        if key.is_empty() || !has_allowed_extension(&key) {
            return Err(Error::Validation(format!(
                "file name {file_name:?} has no usable characters"
            )));
        }

        Ok(key)
    }
}

/// True when the text after the last dot is an allowed extension.
pub fn has_allowed_extension(file_name: &str) -> bool {
    match file_name.rsplit_once('.') {
        Some((_, ext)) => ALLOWED_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}

/// Reduce a client-supplied file name to a flat, ASCII-only object key.
///
/// Path separators become spaces, everything outside `[A-Za-z0-9._-]` and
/// whitespace is dropped, whitespace runs become `_`, and leading or
/// trailing dots and underscores are trimmed.
pub fn sanitize_filename(file_name: &str) -> String {
    let flattened: String = file_name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");

    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();

    kept.trim_matches(|c| c == '.' || c == '_').to_string()
}
