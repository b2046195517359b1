//! Prometheus metrics endpoint and counter wiring.
//!
//! The registry is process-global, so assertions are relative: counters
//! only ever move up.

mod common;

use axum::body::Body;
use axum::http::Method;
use common::*;
use depot_server::metrics;

async fn scrape(app: &TestApp) -> String {
    let response = app
        .send(request(
            Method::GET,
            "/metrics",
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 200);
    String::from_utf8(body_bytes(response).await.to_vec()).unwrap()
}

#[tokio::test]
async fn test_upload_lifecycle_moves_counters() {
    let app = test_app().await;

    let created_before = metrics::UPLOADS_CREATED.get();
    let finished_before = metrics::UPLOADS_FINISHED.get();
    let terminated_before = metrics::UPLOADS_TERMINATED.get();
    let bytes_before = metrics::BYTES_UPLOADED.get();

    let id = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "5")]).await;
    patch_upload(&app, &id, 0, b"hello").await;
    let response = app
        .send(request(
            Method::DELETE,
            &format!("/files/{id}"),
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 204);

    assert!(metrics::UPLOADS_CREATED.get() > created_before);
    assert!(metrics::UPLOADS_FINISHED.get() > finished_before);
    assert!(metrics::UPLOADS_TERMINATED.get() > terminated_before);
    assert!(metrics::BYTES_UPLOADED.get() >= bytes_before + 5);

    let body = scrape(&app).await;
    assert!(body.contains("depot_uploads_created_total"));
    assert!(body.contains("depot_uploads_finished_total"));
    assert!(body.contains("depot_uploads_terminated_total"));
    assert!(body.contains("depot_bytes_uploaded_total"));
}

#[tokio::test]
async fn test_dedup_hit_counted() {
    let app = test_app().await;
    let dedup_before = metrics::UPLOADS_DEDUPLICATED.get();

    // Two identical payloads: the second finish lands on an existing blob.
    let first = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "7")]).await;
    patch_upload(&app, &first, 0, b"samebit").await;
    let second = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "7")]).await;
    patch_upload(&app, &second, 0, b"samebit").await;

    assert!(metrics::UPLOADS_DEDUPLICATED.get() > dedup_before);
}

#[tokio::test]
async fn test_gc_sweep_counted() {
    let app = test_app_with(|config| {
        config.expiration.max_age_anonymous_secs = 1;
    })
    .await;

    let sweeps_before = metrics::GC_SWEEPS.get();
    let expired_before = metrics::GC_UPLOADS_EXPIRED.get();

    let id = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "2")]).await;
    patch_upload(&app, &id, 0, b"hi").await;

    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    depot_server::expirer::sweep(
        &app.state.metadata,
        &app.gc_router,
        row.expires_at + 2,
        std::time::Duration::ZERO,
    )
    .await;

    assert!(metrics::GC_SWEEPS.get() > sweeps_before);
    assert!(metrics::GC_UPLOADS_EXPIRED.get() > expired_before);

    let body = scrape(&app).await;
    assert!(body.contains("depot_gc_sweeps_total"));
    assert!(body.contains("depot_gc_uploads_expired_total"));
    assert!(body.contains("depot_gc_failures_total"));
}

#[tokio::test]
async fn test_metrics_endpoint_can_be_disabled() {
    let app = test_app_with(|config| {
        config.server.metrics_enabled = false;
    })
    .await;

    let response = app
        .send(request(
            Method::GET,
            "/metrics",
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 404);
}
