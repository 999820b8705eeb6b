use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::records::{CaptionUpdate, ImageRecord};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Durable table of [`ImageRecord`]s keyed by object key.
///
/// Implementations must keep `caption` monotonic: once a row has a caption,
/// neither [`insert`](MetadataStore::insert) nor
/// [`set_caption_if_absent`](MetadataStore::set_caption_if_absent) may
/// change it.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Insert a record. `uploaded_at` is set once, on creation.
    ///
    /// On conflict the existing row is kept as is: its `uploaded_at` and any
    /// caption it has survive a re-upload. A pending row may take the new
    /// caption. Returns the record as stored.
    async fn insert(
        &self,
        image_key: &str,
        caption: Option<&str>,
        uploaded_at: DateTime<Utc>,
    ) -> Result<ImageRecord>;

    /// Insert a record without a caption.
    async fn insert_pending(&self, image_key: &str, uploaded_at: DateTime<Utc>) -> Result<ImageRecord> {
        self.insert(image_key, None, uploaded_at).await
    }

    /// Store `caption` only if the record exists and has none yet.
    async fn set_caption_if_absent(&self, image_key: &str, caption: &str) -> Result<CaptionUpdate>;

    /// Look up a single record.
    async fn get(&self, image_key: &str) -> Result<Option<ImageRecord>>;

    /// All records ordered by `uploaded_at` descending.
    async fn list_all_desc_by_time(&self) -> Result<Vec<ImageRecord>>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> Result<()>;
}

/// Metadata store backed by PostgreSQL
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, caption), fields(image_key = %image_key))]
    async fn insert(
        &self,
        image_key: &str,
        caption: Option<&str>,
        uploaded_at: DateTime<Utc>,
    ) -> Result<ImageRecord> {
        let record = sqlx::query_as::<_, ImageRecord>(
            r#"
            INSERT INTO images (image_key, caption, uploaded_at, captioned_at)
            VALUES ($1, $2, $3, CASE WHEN $2::text IS NULL THEN NULL ELSE NOW() END)
            ON CONFLICT (image_key) DO UPDATE SET
                caption = COALESCE(images.caption, EXCLUDED.caption),
                captioned_at = COALESCE(images.captioned_at, EXCLUDED.captioned_at)
            RETURNING image_key, caption, uploaded_at
            "#,
        )
        .bind(image_key)
        .bind(caption)
        .bind(uploaded_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::MetadataWrite(e.to_string()))?;

        metrics::counter!("gallery.records.inserted").increment(1);

        Ok(record)
    }

    #[instrument(skip(self, caption), fields(image_key = %image_key))]
    async fn set_caption_if_absent(&self, image_key: &str, caption: &str) -> Result<CaptionUpdate> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET caption = $2, captioned_at = NOW()
            WHERE image_key = $1 AND caption IS NULL
            "#,
        )
        .bind(image_key)
        .bind(caption)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::MetadataWrite(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(CaptionUpdate::Applied);
        }

        let exists: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM images WHERE image_key = $1)")
                .bind(image_key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| Error::MetadataWrite(e.to_string()))?;

        debug!(image_key = %image_key, exists = exists.0, "Caption update matched no pending row");

        Ok(if exists.0 {
            CaptionUpdate::AlreadySet
        } else {
            CaptionUpdate::Missing
        })
    }

    async fn get(&self, image_key: &str) -> Result<Option<ImageRecord>> {
        sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT image_key, caption, uploaded_at
            FROM images
            WHERE image_key = $1
            "#,
        )
        .bind(image_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::MetadataRead(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn list_all_desc_by_time(&self) -> Result<Vec<ImageRecord>> {
        sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT image_key, caption, uploaded_at
            FROM images
            ORDER BY uploaded_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::MetadataRead(e.to_string()))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| Error::MetadataRead(e.to_string()))
    }
}
