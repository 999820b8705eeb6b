use crate::error::Result;
use crate::object_store::ObjectStore;
use crate::records::{ImageRecord, RecordLifecycle};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// One presentable gallery item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GalleryEntry {
    /// Presigned URL for the image
    pub url: String,
    /// Caption text, or the pending placeholder
    pub caption: String,
    /// `ready` or `pending`
    pub status: &'static str,
    pub image_key: String,
    pub uploaded_at: DateTime<Utc>,
    /// When `url` stops working
    pub expires_at: DateTime<Utc>,
}

/// Joins metadata records with freshly issued access URLs.
#[derive(Clone)]
pub struct GalleryReconciler {
    lifecycle: RecordLifecycle,
    objects: Arc<dyn ObjectStore>,
    url_ttl: Duration,
    presign_concurrency: usize,
}

impl GalleryReconciler {
    pub fn new(
        lifecycle: RecordLifecycle,
        objects: Arc<dyn ObjectStore>,
        url_ttl: Duration,
        presign_concurrency: usize,
    ) -> Self {
        Self {
            lifecycle,
            objects,
            url_ttl,
            presign_concurrency: presign_concurrency.max(1),
        }
    }

    /// Build the gallery, newest upload first.
    ///
    /// A record whose URL cannot be issued is left out; only a failure to
    /// read the records fails the whole listing.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<GalleryEntry>> {
        let records = self.lifecycle.list_newest_first().await?;
        let total = records.len();

        // `buffered` keeps input order, so the newest-first order survives.
        let entries: Vec<GalleryEntry> = stream::iter(records)
            .map(|record| self.reconcile(record))
            .buffered(self.presign_concurrency)
            .filter_map(|entry| async move { entry })
            .collect()
            .await;

        debug!(total, listed = entries.len(), "Gallery reconciled");

        Ok(entries)
    }

    async fn reconcile(&self, record: ImageRecord) -> Option<GalleryEntry> {
        match self.objects.presign_get(&record.image_key, self.url_ttl).await {
            Ok(presigned) => {
                let state = record.caption_state();
                Some(GalleryEntry {
                    url: presigned.url,
                    caption: state.text().to_string(),
                    status: state.label(),
                    image_key: record.image_key,
                    uploaded_at: record.uploaded_at,
                    expires_at: presigned.expires_at,
                })
            }
            Err(e) => {
                warn!(image_key = %record.image_key, error = %e, "Skipping gallery entry");
                metrics::counter!("gallery.presign.failed").increment(1);
                None
            }
        }
    }
}
