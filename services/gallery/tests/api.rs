use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use gallery_service::api::create_router;
use gallery_service::config::{ApiConfig, CaptionMode};
use gallery_service::{
    AppState, CaptionProducer, CaptionGenerator, CaptionStrategy, CaptionUpdate,
    MemoryMetadataStore, MemoryObjectStore, MetadataStore, ObjectStore, RecordLifecycle,
};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const BOUNDARY: &str = "gallery-test-boundary";

/// Deferred captioning with no transport: records stay pending until the
/// test plays the part of the caption worker.
struct ExternalTrigger;

#[async_trait]
impl CaptionStrategy for ExternalTrigger {
    fn mode(&self) -> CaptionMode {
        CaptionMode::Deferred
    }
}

struct FixedCaption(&'static str);

#[async_trait]
impl CaptionGenerator for FixedCaption {
    async fn generate(&self, _image: &[u8], _content_type: &str) -> gallery_service::Result<String> {
        Ok(self.0.to_string())
    }
}

struct TestApp {
    router: Router,
    objects: Arc<MemoryObjectStore>,
    records: Arc<MemoryMetadataStore>,
}

impl TestApp {
    fn new() -> Self {
        let objects = Arc::new(MemoryObjectStore::new("captions"));
        let records = Arc::new(MemoryMetadataStore::new());
        let state = AppState::new(
            objects.clone(),
            records.clone(),
            Arc::new(ExternalTrigger),
            Duration::from_secs(3600),
            1024 * 1024,
            4,
        );

        Self {
            router: create_router(state, &ApiConfig::default()),
            objects,
            records,
        }
    }

    fn caption_worker(&self, caption: &'static str) -> CaptionProducer {
        CaptionProducer::new(
            RecordLifecycle::new(self.records.clone()),
            self.objects.clone(),
            Arc::new(FixedCaption(caption)),
        )
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    async fn upload(&self, file_name: &str, data: &[u8]) -> (StatusCode, Value) {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/images")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        self.send(request).await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        self.send(request).await
    }
}

#[tokio::test]
async fn upload_then_poll_until_caption_is_ready() {
    let app = TestApp::new();

    let (status, receipt) = app.upload("cat.png", b"\x89PNG fake image").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["image_key"], "cat.png");
    assert!(receipt["url"].as_str().unwrap().contains("cat.png"));
    assert!(receipt["caption"].is_null());
    assert_eq!(
        app.objects.object("cat.png").unwrap().data,
        b"\x89PNG fake image".to_vec()
    );

    let (status, body) = app.get("/api/v1/images/cat.png/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processing");

    let update = app
        .caption_worker("A cat sitting on a windowsill")
        .produce("cat.png", None)
        .await
        .unwrap();
    assert_eq!(update, CaptionUpdate::Applied);

    let (status, body) = app.get("/api/v1/images/cat.png/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["caption"], "A cat sitting on a windowsill");
}

#[tokio::test]
async fn disallowed_extension_is_rejected_without_side_effects() {
    let app = TestApp::new();

    let (status, body) = app.upload("virus.exe", b"MZ\x90\x00").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(app.objects.is_empty());
    assert!(app.records.is_empty());
}

#[tokio::test]
async fn polling_unknown_key_is_not_found() {
    let app = TestApp::new();

    let (status, body) = app.get("/api/v1/images/missing.png/status").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn repeated_caption_delivery_keeps_first_caption() {
    let app = TestApp::new();
    app.upload("dog.jpg", b"jpeg").await;

    app.caption_worker("A dog").produce("dog.jpg", None).await.unwrap();
    let second = app
        .caption_worker("A wolf")
        .produce("dog.jpg", None)
        .await
        .unwrap();

    assert_eq!(second, CaptionUpdate::AlreadySet);
    let (_, body) = app.get("/api/v1/images/dog.jpg/status").await;
    assert_eq!(body["caption"], "A dog");
}

#[tokio::test]
async fn gallery_lists_newest_first_and_skips_unsignable_records() {
    let app = TestApp::new();
    let base = chrono::Utc::now();
    for (i, key) in ["one.png", "two.png", "three.png"].iter().enumerate() {
        app.objects.put(key, b"png", "image/png").await.unwrap();
        app.records
            .insert_pending(key, base + chrono::Duration::seconds(i as i64))
            .await
            .unwrap();
    }
    app.records
        .set_caption_if_absent("one.png", "First picture")
        .await
        .unwrap();
    app.objects.fail_presign_for("two.png");

    let (status, body) = app.get("/api/v1/images").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    let images = body["images"].as_array().unwrap();
    assert_eq!(images[0]["image_key"], "three.png");
    assert_eq!(images[0]["caption"], "pending");
    assert_eq!(images[0]["status"], "pending");
    assert_eq!(images[1]["image_key"], "one.png");
    assert_eq!(images[1]["caption"], "First picture");
    assert!(images[1]["url"].as_str().unwrap().starts_with("memory://"));
}

#[tokio::test]
async fn storage_outage_fails_upload_and_creates_no_record() {
    let app = TestApp::new();
    app.objects.set_available(false);

    let (status, body) = app.upload("cat.png", b"png").await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "STORAGE_WRITE_ERROR");
    assert!(app.records.is_empty());
}

#[tokio::test]
async fn metadata_outage_reports_error_and_leaves_object() {
    let app = TestApp::new();
    app.records.set_available(false);

    let (status, body) = app.upload("cat.png", b"png").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "METADATA_WRITE_ERROR");
    assert!(app.objects.object("cat.png").is_some());

    let (status, body) = app.get("/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");
}

#[tokio::test]
async fn image_url_requires_a_record() {
    let app = TestApp::new();
    app.upload("cat.gif", b"GIF89a").await;

    let (status, body) = app.get("/api/v1/images/cat.gif/url").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["image_key"], "cat.gif");
    assert!(body["url"].as_str().is_some());
    assert!(body["expires_at"].as_str().is_some());

    let (status, body) = app.get("/api/v1/images/other.gif/url").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn upload_without_file_field_is_rejected() {
    let app = TestApp::new();
    let body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{BOUNDARY}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/images")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();

    let (status, body) = app.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn reupload_replaces_bytes_but_keeps_record_position() {
    let app = TestApp::new();
    let (_, first) = app.upload("a.png", b"first").await;
    app.upload("b.png", b"png").await;

    let (status, again) = app.upload("a.png", b"second").await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(again["uploaded_at"], first["uploaded_at"]);
    assert_eq!(app.objects.object("a.png").unwrap().data, b"second".to_vec());

    let (_, body) = app.get("/api/v1/images").await;
    let images = body["images"].as_array().unwrap();
    assert_eq!(images[0]["image_key"], "b.png");
    assert_eq!(images[1]["image_key"], "a.png");
}
