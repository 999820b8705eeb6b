//! Image+caption record lifecycle.
//!
//! A record is created pending by the upload path, gains its caption exactly
//! once through [`RecordLifecycle::attach_caption`], and is read forever
//! after. The persisted `caption` column is the only state; nothing here
//! caches it, so every component re-derives state from the metadata store.

use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Placeholder shown by read paths while a caption is absent.
pub const PENDING_CAPTION: &str = "pending";

/// The sole persisted entity: one row per stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    /// Object key in the object store, primary key
    pub image_key: String,
    /// Generated caption, `None` while pending
    pub caption: Option<String>,
    /// Upload time, sole ordering key for listings
    pub uploaded_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn pending(image_key: impl Into<String>, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            image_key: image_key.into(),
            caption: None,
            uploaded_at,
        }
    }

    pub fn caption_state(&self) -> CaptionState {
        match &self.caption {
            Some(caption) => CaptionState::Ready(caption.clone()),
            None => CaptionState::Pending,
        }
    }
}

/// Read projection of the caption column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionState {
    Pending,
    Ready(String),
}

impl CaptionState {
    /// Caption text, or the pending placeholder.
    pub fn text(&self) -> &str {
        match self {
            CaptionState::Pending => PENDING_CAPTION,
            CaptionState::Ready(caption) => caption,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CaptionState::Ready(_))
    }

    /// Short status label used in API bodies.
    pub fn label(&self) -> &'static str {
        match self {
            CaptionState::Pending => "pending",
            CaptionState::Ready(_) => "ready",
        }
    }
}

/// Outcome of a conditional caption write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionUpdate {
    /// The record was pending and now carries the caption
    Applied,
    /// The record already had a caption; nothing changed
    AlreadySet,
    /// No record exists for the key
    Missing,
}

/// Owns the state transitions of [`ImageRecord`]s.
#[derive(Clone)]
pub struct RecordLifecycle {
    store: Arc<dyn MetadataStore>,
}

impl RecordLifecycle {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Create the record for an object that has already been written.
    ///
    /// `caption` is `Some` only when the caption was produced inline. A
    /// record that already exists for the key keeps its caption and its
    /// original `uploaded_at`.
    #[instrument(skip(self, caption), fields(image_key = %image_key, captioned = caption.is_some()))]
    pub async fn create(
        &self,
        image_key: &str,
        caption: Option<&str>,
        uploaded_at: DateTime<Utc>,
    ) -> Result<ImageRecord> {
        let caption = caption.map(str::trim).filter(|c| !c.is_empty());
        let record = self.store.insert(image_key, caption, uploaded_at).await?;

        debug!(
            image_key = %record.image_key,
            state = record.caption_state().label(),
            "Image record created"
        );

        Ok(record)
    }

    /// Transition a record from pending to captioned.
    ///
    /// Repeated calls are harmless: once a caption is stored every later
    /// call reports [`CaptionUpdate::AlreadySet`] and leaves it untouched.
    #[instrument(skip(self, caption), fields(image_key = %image_key))]
    pub async fn attach_caption(&self, image_key: &str, caption: &str) -> Result<CaptionUpdate> {
        let caption = caption.trim();
        if caption.is_empty() {
            return Err(Error::CaptionGeneration(format!(
                "refusing to store an empty caption for {image_key}"
            )));
        }

        let update = self.store.set_caption_if_absent(image_key, caption).await?;

        match update {
            CaptionUpdate::Applied => info!(image_key = %image_key, "Caption attached"),
            CaptionUpdate::AlreadySet => {
                debug!(image_key = %image_key, "Caption already present, keeping existing value")
            }
            CaptionUpdate::Missing => {
                debug!(image_key = %image_key, "No record for caption update")
            }
        }

        Ok(update)
    }

    pub async fn get(&self, image_key: &str) -> Result<Option<ImageRecord>> {
        self.store.get(image_key).await
    }

    /// All records, newest upload first.
    pub async fn list_newest_first(&self) -> Result<Vec<ImageRecord>> {
        let mut records = self.store.list_all_desc_by_time().await?;
        // Stable; equal timestamps keep adapter order.
        records.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(records)
    }

    /// Metadata store connectivity check
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMetadataStore;
    use chrono::{Duration, TimeZone};

    fn lifecycle() -> (RecordLifecycle, Arc<MemoryMetadataStore>) {
        let store = Arc::new(MemoryMetadataStore::new());
        (RecordLifecycle::new(store.clone()), store)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_caption_state_projection() {
        let mut record = ImageRecord::pending("cat.png", at(0));
        assert_eq!(record.caption_state(), CaptionState::Pending);
        assert_eq!(record.caption_state().text(), PENDING_CAPTION);

        record.caption = Some("A cat on a sofa".to_string());
        assert!(record.caption_state().is_ready());
        assert_eq!(record.caption_state().text(), "A cat on a sofa");
    }

    #[tokio::test]
    async fn test_create_pending_record() {
        let (lifecycle, _) = lifecycle();
        let record = lifecycle.create("cat.png", None, at(0)).await.unwrap();

        assert_eq!(record.image_key, "cat.png");
        assert_eq!(record.caption, None);
        assert_eq!(lifecycle.get("cat.png").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_caption_is_monotonic() {
        let (lifecycle, _) = lifecycle();
        lifecycle.create("cat.png", None, at(0)).await.unwrap();

        let first = lifecycle.attach_caption("cat.png", "A cat").await.unwrap();
        let second = lifecycle.attach_caption("cat.png", "A dog").await.unwrap();

        assert_eq!(first, CaptionUpdate::Applied);
        assert_eq!(second, CaptionUpdate::AlreadySet);
        let record = lifecycle.get("cat.png").await.unwrap().unwrap();
        assert_eq!(record.caption.as_deref(), Some("A cat"));
    }

    #[tokio::test]
    async fn test_attach_caption_without_record() {
        let (lifecycle, _) = lifecycle();
        let update = lifecycle.attach_caption("missing.png", "A cat").await.unwrap();
        assert_eq!(update, CaptionUpdate::Missing);
        assert!(lifecycle.get("missing.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_caption_rejected() {
        let (lifecycle, _) = lifecycle();
        lifecycle.create("cat.png", None, at(0)).await.unwrap();

        let err = lifecycle.attach_caption("cat.png", "   ").await.unwrap_err();
        assert!(matches!(err, Error::CaptionGeneration(_)));
        assert_eq!(lifecycle.get("cat.png").await.unwrap().unwrap().caption, None);
    }

    #[tokio::test]
    async fn test_reupload_keeps_caption_and_creation_time() {
        let (lifecycle, _) = lifecycle();
        lifecycle.create("cat.png", Some("A cat"), at(0)).await.unwrap();
        lifecycle.create("dog.png", None, at(30)).await.unwrap();

        let record = lifecycle.create("cat.png", None, at(60)).await.unwrap();

        assert_eq!(record.caption.as_deref(), Some("A cat"));
        assert_eq!(record.uploaded_at, at(0));

        let keys: Vec<_> = lifecycle
            .list_newest_first()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.image_key)
            .collect();
        assert_eq!(keys, vec!["dog.png", "cat.png"]);
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let (lifecycle, _) = lifecycle();
        lifecycle.create("a.png", None, at(10)).await.unwrap();
        lifecycle.create("b.png", None, at(30)).await.unwrap();
        lifecycle.create("c.png", None, at(20)).await.unwrap();

        let keys: Vec<_> = lifecycle
            .list_newest_first()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.image_key)
            .collect();

        assert_eq!(keys, vec!["b.png", "c.png", "a.png"]);
    }

    #[tokio::test]
    async fn test_metadata_outage_surfaces_typed_error() {
        let (lifecycle, store) = lifecycle();
        store.set_available(false);

        let err = lifecycle.create("cat.png", None, at(0)).await.unwrap_err();
        assert!(matches!(err, Error::MetadataWrite(_)));
        let err = lifecycle.get("cat.png").await.unwrap_err();
        assert!(matches!(err, Error::MetadataRead(_)));
    }
}
