//! HTTP surface tests driven through actix-web's test harness

use actix_web::body::to_bytes;
use actix_web::{http::StatusCode, test, web, App};
use event_schema::{CompletionEvent, MetricsSnapshot, SESSION_TOKEN_METADATA_KEY};
use live_update_service::config::{Config, HubConfig};
use live_update_service::handlers;
use live_update_service::hub::{event_channel, spawn_dispatchers, FanoutHub};
use live_update_service::sns::RecordingConfirmer;
use live_update_service::AppState;
use object_store::{InMemoryObjectStore, ObjectStore, StoredObject};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

const BOUNDARY: &str = "----pipeline-test-boundary";

struct Harness {
    state: AppState,
    store: Arc<InMemoryObjectStore>,
    confirmer: Arc<RecordingConfirmer>,
}

fn harness() -> Harness {
    harness_with(Config::default(), InMemoryObjectStore::new())
}

fn harness_with(config: Config, store: InMemoryObjectStore) -> Harness {
    let config = Config {
        hub: HubConfig {
            grace_period: Duration::from_millis(20),
            ..HubConfig::default()
        },
        ..config
    };
    let store = Arc::new(store);
    let confirmer = Arc::new(RecordingConfirmer::new());
    let hub = FanoutHub::new(config.hub.clone());
    let (events, receivers) = event_channel(&hub, 16);
    spawn_dispatchers(&hub, receivers);

    let state = AppState {
        config,
        store: store.clone(),
        hub,
        events,
        confirmer: confirmer.clone(),
        ready: Arc::new(AtomicBool::new(true)),
    };

    Harness {
        state,
        store,
        confirmer,
    }
}

fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: image/png\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn completion(key: &str, session: &str) -> CompletionEvent {
    CompletionEvent::new(
        format!("uploads/{key}"),
        format!("processed/{key}"),
        Some(session.to_string()),
        MetricsSnapshot {
            duration_ms: 12,
            cost_estimate: 0.0005,
        },
    )
}

#[actix_rt::test]
async fn test_upload_stores_object_with_session() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/upload?session=session-a")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body("file", "photo1.png", b"not-really-a-png"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let json: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(json["message"], "Uploaded");
    assert_eq!(json["session"], "session-a");
    let key = json["key"].as_str().unwrap().to_string();
    assert!(key.ends_with("-photo1.png"));

    let stored = h.store.get("uploads", &key).await.unwrap();
    assert_eq!(&stored.data[..], b"not-really-a-png");
    assert_eq!(stored.metadata_value(SESSION_TOKEN_METADATA_KEY), Some("session-a"));
    assert_eq!(stored.content_type.as_deref(), Some("image/png"));
}

#[actix_rt::test]
async fn test_same_filename_uploaded_twice_keeps_both() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let mut keys = Vec::new();
    for body in [&b"first"[..], &b"second"[..]] {
        let req = test::TestRequest::post()
            .uri("/upload?session=session-a")
            .insert_header((
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart_body("file", "photo1.png", body))
            .to_request();
        let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        keys.push(json["key"].as_str().unwrap().to_string());
    }

    assert_ne!(keys[0], keys[1]);
    assert_eq!(h.store.object_count("uploads"), 2);
    assert_eq!(&h.store.get("uploads", &keys[0]).await.unwrap().data[..], b"first");
    assert_eq!(&h.store.get("uploads", &keys[1]).await.unwrap().data[..], b"second");
}

#[actix_rt::test]
async fn test_upload_mints_session_when_missing() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/upload")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body("file", "a.png", b"x"))
        .to_request();
    let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;

    let session = json["session"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(session).is_ok());
}

#[actix_rt::test]
async fn test_upload_without_file_field_is_rejected() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/upload")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body("attachment", "a.png", b"x"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let json: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(json["status"], 400);
    assert!(json["message"].as_str().unwrap().contains("No file provided"));
    assert_eq!(h.store.put_count(), 0);
}

#[actix_rt::test]
async fn test_upload_store_failure_is_500() {
    let h = harness();
    h.store.fail_next_puts(1);
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/upload?session=s")
        .insert_header((
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        ))
        .set_payload(multipart_body("file", "a.png", b"x"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[actix_rt::test]
async fn test_sns_subscription_confirmation() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let body = serde_json::json!({
        "Type": "SubscriptionConfirmation",
        "TopicArn": "arn:aws:sns:us-east-1:000000000000:processed-updates",
        "Token": "confirm-token",
        "SubscribeURL": "http://localhost:4566/?Action=ConfirmSubscription"
    });
    let req = test::TestRequest::post()
        .uri("/sns/processed")
        .set_payload(body.to_string())
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(
        h.confirmer.confirmed(),
        vec![(
            "arn:aws:sns:us-east-1:000000000000:processed-updates".to_string(),
            "confirm-token".to_string()
        )]
    );
}

#[actix_rt::test]
async fn test_sns_notification_reaches_matching_subscriber() {
    let h = harness();
    let mine = h.state.hub.subscribe("session-a").unwrap();
    let other = h.state.hub.subscribe("session-b").unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let event = completion("photo1.png", "session-a");
    let body = serde_json::json!({
        "Type": "Notification",
        "MessageId": "m-1",
        "Message": event.to_json().unwrap(),
    });
    let req = test::TestRequest::post()
        .uri("/sns/processed")
        .set_payload(body.to_string())
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

    let payload = tokio::time::timeout(Duration::from_secs(1), mine.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.object_key, "uploads/photo1.png");
    assert_eq!(payload.processed_key, "processed/photo1.png");
    assert!(other.try_next().is_none());
}

#[actix_rt::test]
async fn test_sns_malformed_bodies_are_400() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    for payload in [
        String::new(),
        "not json".to_string(),
        serde_json::json!({"Type": "Notification", "Message": "{\"Records\": []}"}).to_string(),
    ] {
        let req = test::TestRequest::post()
            .uri("/sns/processed")
            .set_payload(payload)
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST
        );
    }
}

#[actix_rt::test]
async fn test_processed_listing() {
    let h = harness();
    h.store
        .put("processed", "1700000000-a.png", StoredObject::new(vec![1u8]))
        .await
        .unwrap();
    h.store
        .put("processed", "1700000001-b.png", StoredObject::new(vec![2u8]))
        .await
        .unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/processed").to_request();
    let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(json["count"], 2);
    assert_eq!(json["objects"][0]["processedKey"], "processed/1700000000-a.png");
    let url = json["objects"][0]["url"].as_str().unwrap();
    assert!(url.contains("/processed/1700000000-a.png"));
    assert!(url.contains("X-Amz-Expires=3600"));

    let req = test::TestRequest::get()
        .uri("/processed?prefix=1700000001")
        .to_request();
    let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["objects"][0]["key"], "1700000001-b.png");
}

#[actix_rt::test]
async fn test_processed_urls_point_at_public_endpoint() {
    let mut config = Config::default();
    config.aws.endpoint_url = Some("http://localstack:4566".to_string());
    config.storage.public_s3_endpoint = "http://photos.example.test".to_string();
    let h = harness_with(config, InMemoryObjectStore::with_endpoint("http://localstack:4566"));
    h.store
        .put("processed", "1700000000-a.png", StoredObject::new(vec![1u8]))
        .await
        .unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/processed").to_request();
    let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(
        json["objects"][0]["url"],
        "http://photos.example.test/processed/1700000000-a.png?X-Amz-Expires=3600"
    );
}

#[actix_rt::test]
async fn test_events_requires_session() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/events").to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[actix_rt::test]
async fn test_event_stream_frames() {
    let h = harness();
    let hub = h.state.hub.clone();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/events?session=session-a")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(hub.subscriber_count("session-a"), 1);

    hub.dispatch(&completion("photo1.png", "session-a"));

    // Shutdown drains the stream: buffered event, then the closing frame
    let (_, body) = tokio::join!(
        hub.shutdown(Duration::from_millis(20)),
        to_bytes(resp.into_body())
    );
    let text = String::from_utf8(body.unwrap().to_vec()).unwrap();

    let connected = text.find("event: connected").unwrap();
    let completion = text.find("event: completion").unwrap();
    let closed = text.find("event: closed").unwrap();
    assert!(connected < completion && completion < closed);
    assert!(text.contains(r#""objectKey":"uploads/photo1.png""#));
    assert!(text.contains(r#""processedKey":"processed/photo1.png""#));
    assert_eq!(hub.connection_count(), 0);
}

#[actix_rt::test]
async fn test_health_endpoints() {
    let h = harness();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(h.state.clone()))
            .configure(handlers::configure),
    )
    .await;

    let req = test::TestRequest::get().uri("/api/v1/health").to_request();
    let json: serde_json::Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(json["status"], "ok");

    let req = test::TestRequest::get().uri("/api/v1/health/ready").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

    h.state.hub.shutdown(Duration::from_millis(1)).await;
    let req = test::TestRequest::get().uri("/api/v1/health/ready").to_request();
    assert_eq!(
        test::call_service(&app, req).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
}
