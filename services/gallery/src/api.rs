use crate::caption::CaptionStrategy;
use crate::config::ApiConfig;
use crate::error::Error;
use crate::gallery::{GalleryEntry, GalleryReconciler};
use crate::metadata_store::MetadataStore;
use crate::object_store::{ObjectStore, PresignedUrl};
use crate::poller::{PollStatus, StatusPoller};
use crate::records::RecordLifecycle;
use crate::upload::{UploadCoordinator, UploadReceipt};
use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Multipart framing allowance on top of the largest accepted image
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub uploads: UploadCoordinator,
    pub gallery: GalleryReconciler,
    pub poller: StatusPoller,
    pub lifecycle: RecordLifecycle,
    pub objects: Arc<dyn ObjectStore>,
    pub presigned_url_expiry: Duration,
    pub max_upload_bytes: usize,
}

impl AppState {
    /// Wire the components around one pair of store adapters.
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        captions: Arc<dyn CaptionStrategy>,
        presigned_url_expiry: Duration,
        max_upload_bytes: usize,
        presign_concurrency: usize,
    ) -> Self {
        let lifecycle = RecordLifecycle::new(metadata);

        Self {
            uploads: UploadCoordinator::new(
                objects.clone(),
                lifecycle.clone(),
                captions,
                max_upload_bytes,
                presigned_url_expiry,
            ),
            gallery: GalleryReconciler::new(
                lifecycle.clone(),
                objects.clone(),
                presigned_url_expiry,
                presign_concurrency,
            ),
            poller: StatusPoller::new(lifecycle.clone()),
            lifecycle,
            objects,
            presigned_url_expiry,
            max_upload_bytes,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Gallery listing response
#[derive(Debug, Serialize)]
pub struct GalleryResponse {
    pub images: Vec<GalleryEntry>,
    pub count: usize,
}

/// Presigned URL response for a single image
#[derive(Debug, Serialize)]
pub struct ImageUrlResponse {
    pub image_key: String,
    #[serde(flatten)]
    pub presigned: PresignedUrl,
}

/// Typed error mapped onto an HTTP response
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::StorageWrite(_) | Error::StorageRead(_) | Error::CaptionGeneration(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::MetadataWrite(_) | Error::MetadataRead(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, code = self.0.code(), "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: self.0.code().to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = state.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/images", get(list_gallery).post(upload_image))
        .route("/api/v1/images/:image_key/status", get(poll_status))
        .route("/api/v1/images/:image_key/url", get(get_image_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "gallery-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.lifecycle.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept a multipart upload with a `file` field
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadReceipt>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| Error::Validation(e.body_text()))?;

        let receipt = state.uploads.upload(&file_name, &data).await?;
        return Ok((StatusCode::CREATED, Json(receipt)));
    }

    Err(Error::Validation("no file selected".to_string()).into())
}

/// Gallery listing, newest first
#[instrument(skip(state))]
async fn list_gallery(State(state): State<AppState>) -> Result<Json<GalleryResponse>, ApiError> {
    let images = state.gallery.list().await?;

    Ok(Json(GalleryResponse {
        count: images.len(),
        images,
    }))
}

/// Caption status for one image
#[instrument(skip(state))]
async fn poll_status(State(state): State<AppState>, Path(image_key): Path<String>) -> Response {
    match state.poller.poll(&image_key).await {
        Ok(PollStatus::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "error",
                "error": format!("image not found: {image_key}"),
                "code": "NOT_FOUND"
            })),
        )
            .into_response(),
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            warn!(image_key = %image_key, error = %e, "Status lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "error",
                    "error": e.to_string(),
                    "code": e.code()
                })),
            )
                .into_response()
        }
    }
}

/// Fresh presigned URL for one image
#[instrument(skip(state))]
async fn get_image_url(
    State(state): State<AppState>,
    Path(image_key): Path<String>,
) -> Result<Json<ImageUrlResponse>, ApiError> {
    if state.lifecycle.get(&image_key).await?.is_none() {
        return Err(Error::NotFound(image_key).into());
    }

    let presigned = state
        .objects
        .presign_get(&image_key, state.presigned_url_expiry)
        .await?;

    Ok(Json(ImageUrlResponse {
        image_key,
        presigned,
    }))
}

/// Start the API server, stopping when `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gallery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptionMode;
    use crate::memory::{MemoryMetadataStore, MemoryObjectStore};

    struct NoCaption;

    #[async_trait::async_trait]
    impl CaptionStrategy for NoCaption {
        fn mode(&self) -> CaptionMode {
            CaptionMode::Deferred
        }
    }

    fn state() -> AppState {
        AppState::new(
            Arc::new(MemoryObjectStore::default()),
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(NoCaption),
            Duration::from_secs(3600),
            1024,
            2,
        )
    }

    fn local_config(port: u16) -> ApiConfig {
        ApiConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..ApiConfig::default()
        }
    }

    #[tokio::test]
    async fn test_server_fails_when_port_is_taken() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let result =
            start_api_server(state(), &local_config(port), CancellationToken::new()).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_server_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { start_api_server(state(), &local_config(0), shutdown).await }
        });

        shutdown.cancel();

        assert!(server.await.unwrap().is_ok());
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::StorageWrite("x".into()), StatusCode::BAD_GATEWAY),
            (Error::MetadataWrite("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::MetadataRead("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, expected) in cases {
            assert_eq!(ApiError(error).status(), expected);
        }
    }
}
