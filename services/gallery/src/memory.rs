//! In-memory adapters.
//!
//! Non-persistent implementations of [`ObjectStore`] and [`MetadataStore`]
//! using DashMap for concurrent access. Used by tests and local runs. Both
//! can be switched into a failing state to exercise the error paths of the
//! upload and read sides.

use crate::error::{Error, Result};
use crate::metadata_store::MetadataStore;
use crate::object_store::{expiry_from_now, ObjectStore, PresignedUrl};
use crate::records::{CaptionUpdate, ImageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Object stored in the memory backend.
#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// In-memory object store.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    objects: DashMap<String, MemoryObject>,
    available: AtomicBool,
    presign_failures: DashSet<String>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
            available: AtomicBool::new(true),
            presign_failures: DashSet::new(),
        }
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, key: &str) -> Option<MemoryObject> {
        self.objects.get(key).map(|o| o.value().clone())
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make presigning fail for one key.
    pub fn fail_presign_for(&self, key: &str) {
        self.presign_failures.insert(key.to_string());
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
        if !self.is_available() {
            return Err(Error::StorageWrite(format!("bucket {} unreachable", self.bucket)));
        }

        self.objects.insert(
            key.to_string(),
            MemoryObject {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.is_available() {
            return Err(Error::StorageRead(format!("bucket {} unreachable", self.bucket)));
        }
        Ok(self.objects.get(key).map(|o| o.data.clone()))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<PresignedUrl> {
        if !self.is_available() || self.presign_failures.contains(key) {
            return Err(Error::StorageRead(format!("cannot presign {key}")));
        }

        Ok(PresignedUrl {
            url: format!(
                "memory://{}/{}?expires_in={}",
                self.bucket,
                key,
                ttl.as_secs()
            ),
            expires_at: expiry_from_now(ttl)?,
        })
    }
}

/// In-memory metadata store.
#[derive(Debug)]
pub struct MemoryMetadataStore {
    records: DashMap<String, ImageRecord>,
    available: AtomicBool,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Simulate the database becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::MetadataWrite("database unreachable".to_string()))
        }
    }

    fn check_read(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::MetadataRead("database unreachable".to_string()))
        }
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn insert(
        &self,
        image_key: &str,
        caption: Option<&str>,
        uploaded_at: DateTime<Utc>,
    ) -> Result<ImageRecord> {
        self.check_write()?;

        let mut entry = self
            .records
            .entry(image_key.to_string())
            .or_insert_with(|| ImageRecord::pending(image_key, uploaded_at));

        if entry.caption.is_none() {
            entry.caption = caption.map(str::to_string);
        }

        Ok(entry.value().clone())
    }

    async fn set_caption_if_absent(&self, image_key: &str, caption: &str) -> Result<CaptionUpdate> {
        self.check_write()?;

        // The entry guard holds the shard lock, so check and set are atomic.
        match self.records.get_mut(image_key) {
            None => Ok(CaptionUpdate::Missing),
            Some(mut record) if record.caption.is_none() => {
                record.caption = Some(caption.to_string());
                Ok(CaptionUpdate::Applied)
            }
            Some(_) => Ok(CaptionUpdate::AlreadySet),
        }
    }

    async fn get(&self, image_key: &str) -> Result<Option<ImageRecord>> {
        self.check_read()?;
        Ok(self.records.get(image_key).map(|r| r.value().clone()))
    }

    async fn list_all_desc_by_time(&self) -> Result<Vec<ImageRecord>> {
        self.check_read()?;
        let mut records: Vec<ImageRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(records)
    }

    async fn ping(&self) -> Result<()> {
        self.check_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_object_roundtrip_and_outage() {
        let store = MemoryObjectStore::new("captions");
        store.put("cat.png", b"png", "image/png").await.unwrap();

        assert_eq!(store.get("cat.png").await.unwrap(), Some(b"png".to_vec()));
        assert_eq!(store.get("dog.png").await.unwrap(), None);
        assert_eq!(store.object("cat.png").unwrap().content_type, "image/png");

        store.set_available(false);
        let err = store.put("dog.png", b"png", "image/png").await.unwrap_err();
        assert!(matches!(err, Error::StorageWrite(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_presign_failure_is_per_key() {
        let store = MemoryObjectStore::new("captions");
        store.fail_presign_for("bad.png");

        let url = store
            .presign_get("cat.png", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.url.starts_with("memory://captions/cat.png"));
        assert!(store
            .presign_get("bad.png", Duration::from_secs(3600))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_insert_keeps_first_upload_time() {
        let store = MemoryMetadataStore::new();
        let first = Utc::now();
        store.insert_pending("cat.png", first).await.unwrap();

        let again = store
            .insert("cat.png", Some("A cat"), first + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(again.uploaded_at, first);
        assert_eq!(again.caption.as_deref(), Some("A cat"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_set_caption_if_absent() {
        let store = MemoryMetadataStore::new();
        store.insert_pending("cat.png", Utc::now()).await.unwrap();

        assert_eq!(
            store.set_caption_if_absent("cat.png", "A cat").await.unwrap(),
            CaptionUpdate::Applied
        );
        assert_eq!(
            store.set_caption_if_absent("cat.png", "A dog").await.unwrap(),
            CaptionUpdate::AlreadySet
        );
        assert_eq!(
            store.set_caption_if_absent("dog.png", "A dog").await.unwrap(),
            CaptionUpdate::Missing
        );
        assert_eq!(
            store.get("cat.png").await.unwrap().unwrap().caption.as_deref(),
            Some("A cat")
        );
    }
}
