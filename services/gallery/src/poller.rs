use crate::error::Result;
use crate::records::{CaptionState, RecordLifecycle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

/// Answer to "is the caption ready yet"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    /// Caption stored
    Ready {
        caption: String,
        uploaded_at: DateTime<Utc>,
    },
    /// Record exists, caption still absent. May already be stale.
    Processing { uploaded_at: DateTime<Utc> },
    /// No record for the key
    NotFound,
}

/// Read-only caption status lookups for client-side short polling.
#[derive(Clone)]
pub struct StatusPoller {
    lifecycle: RecordLifecycle,
}

impl StatusPoller {
    pub fn new(lifecycle: RecordLifecycle) -> Self {
        Self { lifecycle }
    }

    #[instrument(skip(self))]
    pub async fn poll(&self, image_key: &str) -> Result<PollStatus> {
        let status = match self.lifecycle.get(image_key).await? {
            None => PollStatus::NotFound,
            Some(record) => match record.caption_state() {
                CaptionState::Ready(caption) => PollStatus::Ready {
                    caption,
                    uploaded_at: record.uploaded_at,
                },
                CaptionState::Pending => PollStatus::Processing {
                    uploaded_at: record.uploaded_at,
                },
            },
        };

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::MemoryMetadataStore;
    use crate::metadata_store::MetadataStore;
    use std::sync::Arc;

    fn poller() -> (StatusPoller, Arc<MemoryMetadataStore>) {
        let store = Arc::new(MemoryMetadataStore::new());
        (StatusPoller::new(RecordLifecycle::new(store.clone())), store)
    }

    #[tokio::test]
    async fn test_processing_then_ready() {
        let (poller, store) = poller();
        let uploaded_at = Utc::now();
        store.insert_pending("cat.png", uploaded_at).await.unwrap();

        assert_eq!(
            poller.poll("cat.png").await.unwrap(),
            PollStatus::Processing { uploaded_at }
        );

        store.set_caption_if_absent("cat.png", "A cat").await.unwrap();

        assert_eq!(
            poller.poll("cat.png").await.unwrap(),
            PollStatus::Ready {
                caption: "A cat".to_string(),
                uploaded_at
            }
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (poller, _) = poller();
        assert_eq!(poller.poll("missing.png").await.unwrap(), PollStatus::NotFound);
    }

    #[tokio::test]
    async fn test_poll_does_not_mutate() {
        let (poller, store) = poller();
        store.insert_pending("cat.png", Utc::now()).await.unwrap();

        let polls = (0..16).map(|_| poller.poll("cat.png"));
        for status in futures::future::join_all(polls).await {
            assert!(matches!(status.unwrap(), PollStatus::Processing { .. }));
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("cat.png").await.unwrap().unwrap().caption, None);
    }

    #[tokio::test]
    async fn test_read_failure_is_typed() {
        let (poller, store) = poller();
        store.set_available(false);
        assert!(matches!(
            poller.poll("cat.png").await,
            Err(Error::MetadataRead(_))
        ));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(PollStatus::NotFound).unwrap();
        assert_eq!(json["status"], "not_found");
    }
}
