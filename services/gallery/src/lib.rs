//! Caption Gallery Service
//!
//! Upload, gallery and caption-status service for the caption gallery
//! platform. Images are stored in S3, one metadata row per image lives in
//! PostgreSQL, and captions arrive either inline during the upload or later
//! from the out-of-process caption worker.
//!
//! ## Coordination
//!
//! There is no shared in-memory state between the web tier and the caption
//! worker. The nullable `caption` column is the single source of truth:
//!
//! - the upload path writes the object first, then inserts the record
//! - the caption producer performs one conditional "set if absent" write
//! - the gallery and the status poller re-read the record on every request
//!
//! ## Architecture
//!
//! ```text
//!   Client                 S3 Bucket                 PostgreSQL
//! ┌──────────────┐  put   ┌──────────────┐         ┌──────────────┐
//! │ Upload       │───────▶│ {image_key}  │         │ images       │
//! │ Coordinator  │────────┼──────────────┼────────▶│  caption?    │
//! └──────────────┘ insert └──────────────┘         └──────────────┘
//!        │                        ▲                    ▲      │
//!        │ upload event           │ get                │      │ read
//!        ▼                        │                    │      ▼
//! ┌──────────────┐        ┌──────────────┐  set if   ┌──────────────┐
//! │ Kafka        │───────▶│ Caption      │──absent───┘│ Gallery /    │
//! │ (deferred)   │        │ Worker       │            │ Status Poller│
//! └──────────────┘        └──────────────┘            └──────────────┘
//! ```

pub mod api;
pub mod caption;
pub mod config;
pub mod error;
pub mod events;
pub mod gallery;
pub mod memory;
pub mod metadata_store;
pub mod object_store;
pub mod poller;
pub mod records;
pub mod upload;

pub use api::{create_router, AppState};
pub use caption::{
    CaptionGenerator, CaptionProducer, CaptionStrategy, DeferredCaptioning, GeminiCaptioner,
    InlineCaptioning,
};
pub use config::{CaptionMode, Config};
pub use error::{Error, Result};
pub use events::{ImageUploadedEvent, KafkaUploadNotifier, UploadNotifier};
pub use gallery::{GalleryEntry, GalleryReconciler};
pub use memory::{MemoryMetadataStore, MemoryObjectStore};
pub use metadata_store::{MetadataStore, PgMetadataStore};
pub use object_store::{ObjectStore, PresignedUrl, S3ObjectStore};
pub use poller::{PollStatus, StatusPoller};
pub use records::{CaptionState, CaptionUpdate, ImageRecord, RecordLifecycle};
pub use upload::{UploadCoordinator, UploadReceipt};
