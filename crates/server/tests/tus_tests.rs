//! Protocol-level tests for the tus handler.

mod common;

use axum::body::Body;
use axum::http::Method;
use common::*;
use depot_core::hash::ContentHash;

#[tokio::test]
async fn test_round_trip_upload() {
    let app = test_app().await;

    // "ZGVtby50eHQ=" = "demo.txt", "dGV4dC9wbGFpbg==" = "text/plain"
    let id = create_upload(
        &app,
        CLIENT_ADDR,
        &[
            ("Upload-Length", "5"),
            (
                "Upload-Metadata",
                "filename ZGVtby50eHQ=,filetype dGV4dC9wbGFpbg==",
            ),
        ],
    )
    .await;
    assert_eq!(id.len(), 32);

    let response = patch_upload(&app, &id, 0, b"hello").await;
    assert_eq!(response.status(), 204);
    assert_eq!(header(&response, "Upload-Offset"), Some("5"));

    // The row records the payload hash, size and an expiry.
    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    let expected = ContentHash::compute(b"hello");
    assert_eq!(row.sha256sum.as_deref(), Some(&expected.as_bytes()[..]));
    assert_eq!(row.file_size, 5);
    assert_eq!(row.file_name, "demo.txt");
    assert_eq!(row.file_type, "text/plain");
    assert!(row.expires_at > 0);

    // The blob sits at its hash-sharded path.
    let blob = app
        .temp
        .path()
        .join("data/complete/2/c")
        .join(format!("{}.bin", expected.to_hex()));
    assert!(blob.exists());

    // GET streams it back, with a cosmetic filename variant too.
    let response = app
        .send(request(
            Method::GET,
            &format!("/files/{id}"),
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        header(&response, "content-disposition"),
        Some("attachment; filename=\"demo.txt\"")
    );
    assert_eq!(&body_bytes(response).await[..], b"hello");

    let response = app
        .send(request(
            Method::GET,
            &format!("/files/{id}/demo.txt"),
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(&body_bytes(response).await[..], b"hello");
}

#[tokio::test]
async fn test_resume_after_partial_patch() {
    let app = test_app().await;
    let id = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "8")]).await;

    let response = patch_upload(&app, &id, 0, b"resu").await;
    assert_eq!(response.status(), 204);
    assert_eq!(header(&response, "Upload-Offset"), Some("4"));

    // HEAD reports the durable offset for resumption.
    let response = head_upload(&app, &id).await;
    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "Upload-Offset"), Some("4"));
    assert_eq!(header(&response, "Upload-Length"), Some("8"));
    assert_eq!(header(&response, "Cache-Control"), Some("no-store"));

    let response = patch_upload(&app, &id, 4, b"med!").await;
    assert_eq!(response.status(), 204);

    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    assert_eq!(
        row.sha256sum.as_deref(),
        Some(&ContentHash::compute(b"resumed!").as_bytes()[..])
    );
}

#[tokio::test]
async fn test_patch_offset_mismatch_conflicts() {
    let app = test_app().await;
    let id = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "5")]).await;

    patch_upload(&app, &id, 0, b"he").await;
    let response = patch_upload(&app, &id, 0, b"llo").await;
    assert_eq!(response.status(), 409);

    // The stored offset is untouched.
    let response = head_upload(&app, &id).await;
    assert_eq!(header(&response, "Upload-Offset"), Some("2"));
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let app = test_app().await;
    let missing = "00000000000000000000000000000000";

    let response = head_upload(&app, missing).await;
    assert_eq!(response.status(), 404);

    let response = patch_upload(&app, missing, 0, b"x").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_create_requires_length_or_deferral() {
    let app = test_app().await;
    let response = app
        .send(request(
            Method::POST,
            "/files",
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 400);

    let response = app
        .send(request(
            Method::POST,
            "/files",
            CLIENT_ADDR,
            &[("Upload-Length", "4"), ("Upload-Defer-Length", "1")],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_quota_enforced_before_writing() {
    let app = test_app_with(|config| {
        config.storage.max_upload_size = 10;
    })
    .await;

    // Declaring more than the limit fails at creation.
    let response = app
        .send(request(
            Method::POST,
            "/files",
            CLIENT_ADDR,
            &[("Upload-Length", "11")],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 413);

    // A deferred-length upload is capped by the limit instead.
    let id = create_upload(&app, CLIENT_ADDR, &[("Upload-Defer-Length", "1")]).await;

    let response = patch_upload(&app, &id, 0, b"12345678").await;
    assert_eq!(response.status(), 204);

    let response = patch_upload(&app, &id, 8, b"90123").await;
    assert_eq!(response.status(), 413);

    // No byte past the limit ever reached the disk.
    let incomplete = app
        .temp
        .path()
        .join("data/incomplete")
        .join(format!("{id}.bin"));
    assert_eq!(std::fs::metadata(&incomplete).unwrap().len(), 8);

    let response = head_upload(&app, &id).await;
    assert_eq!(header(&response, "Upload-Offset"), Some("8"));
}

#[tokio::test]
async fn test_deferred_length_declared_on_patch() {
    let app = test_app().await;
    let id = create_upload(&app, CLIENT_ADDR, &[("Upload-Defer-Length", "1")]).await;

    let response = head_upload(&app, &id).await;
    assert_eq!(header(&response, "Upload-Defer-Length"), Some("1"));

    let response = app
        .send(request(
            Method::PATCH,
            &format!("/files/{id}"),
            CLIENT_ADDR,
            &[
                ("Content-Type", "application/offset+octet-stream"),
                ("Upload-Offset", "0"),
                ("Upload-Length", "6"),
            ],
            Body::from(&b"abc"[..]),
        ))
        .await;
    assert_eq!(response.status(), 204);

    let response = head_upload(&app, &id).await;
    assert_eq!(header(&response, "Upload-Length"), Some("6"));
    assert_eq!(header(&response, "Upload-Offset"), Some("3"));

    let response = patch_upload(&app, &id, 3, b"def").await;
    assert_eq!(response.status(), 204);

    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    assert_eq!(row.file_size, 6);
}

#[tokio::test]
async fn test_concatenation() {
    let app = test_app().await;

    let part_a = create_upload(
        &app,
        CLIENT_ADDR,
        &[("Upload-Length", "3"), ("Upload-Concat", "partial")],
    )
    .await;
    patch_upload(&app, &part_a, 0, b"foo").await;

    let part_b = create_upload(
        &app,
        CLIENT_ADDR,
        &[("Upload-Length", "3"), ("Upload-Concat", "partial")],
    )
    .await;
    patch_upload(&app, &part_b, 0, b"bar").await;

    let concat = format!("final;/files/{part_a} /files/{part_b}");
    let id = create_upload(&app, CLIENT_ADDR, &[("Upload-Concat", &concat)]).await;

    // The final upload finishes immediately.
    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    assert_eq!(
        row.sha256sum.as_deref(),
        Some(&ContentHash::compute(b"foobar").as_bytes()[..])
    );

    let response = head_upload(&app, &id).await;
    assert_eq!(header(&response, "Upload-Concat"), Some(concat.as_str()));

    let response = app
        .send(request(
            Method::GET,
            &format!("/files/{id}"),
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(&body_bytes(response).await[..], b"foobar");

    // Parts remain untouched.
    let response = head_upload(&app, &part_a).await;
    assert_eq!(response.status(), 200);
    assert_eq!(header(&response, "Upload-Concat"), Some("partial"));
}

#[tokio::test]
async fn test_concat_of_incomplete_part_is_rejected() {
    let app = test_app().await;

    let part = create_upload(
        &app,
        CLIENT_ADDR,
        &[("Upload-Length", "5"), ("Upload-Concat", "partial")],
    )
    .await;
    patch_upload(&app, &part, 0, b"ab").await;

    let concat = format!("final;/files/{part}");
    let response = app
        .send(request(
            Method::POST,
            "/files",
            CLIENT_ADDR,
            &[("Upload-Concat", &concat)],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_options_advertises_extensions() {
    let app = test_app().await;
    let response = app
        .send(request(
            Method::OPTIONS,
            "/files",
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 204);
    assert_eq!(header(&response, "Tus-Version"), Some("1.0.0"));
    assert!(
        header(&response, "Tus-Extension")
            .unwrap()
            .contains("concatenation")
    );
    assert!(header(&response, "Tus-Max-Size").is_some());
}

#[tokio::test]
async fn test_cors_echoes_allowlisted_origin() {
    let app = test_app_with(|config| {
        config.server.cors_origins = vec!["https://chat.example.org".to_string()];
    })
    .await;

    let response = app
        .send(request(
            Method::OPTIONS,
            "/files",
            CLIENT_ADDR,
            &[("Origin", "https://chat.example.org")],
            Body::empty(),
        ))
        .await;
    assert_eq!(
        header(&response, "access-control-allow-origin"),
        Some("https://chat.example.org")
    );
    assert!(
        header(&response, "access-control-allow-methods")
            .unwrap()
            .contains("PATCH")
    );
    assert_eq!(header(&response, "vary"), Some("Origin"));

    let response = app
        .send(request(
            Method::OPTIONS,
            "/files",
            CLIENT_ADDR,
            &[("Origin", "https://evil.example.org")],
            Body::empty(),
        ))
        .await;
    assert!(header(&response, "access-control-allow-origin").is_none());
    assert_eq!(header(&response, "vary"), Some("Origin"));
}

#[tokio::test]
async fn test_require_account_gate() {
    let secret = "upload-secret";
    let app = test_app_with(|config| {
        config.server.require_jwt_account = true;
        config
            .server
            .jwt_secrets_by_issuer
            .insert("irc.example.org".to_string(), secret.to_string());
    })
    .await;

    // Anonymous creation is refused.
    let response = app
        .send(request(
            Method::POST,
            "/files",
            CLIENT_ADDR,
            &[("Upload-Length", "3")],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 401);

    // A verified token carries the account through.
    let token = sign_token(secret, "irc.example.org", "nick", "alice");
    let id = create_upload(
        &app,
        CLIENT_ADDR,
        &[("Upload-Length", "3"), ("Authorization", token.leak())],
    )
    .await;

    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    assert_eq!(row.jwt_account, "alice");
    assert_eq!(row.jwt_nick, "nick");
    assert_eq!(row.jwt_issuer, "irc.example.org");
}

#[tokio::test]
async fn test_forged_identity_headers_are_stripped() {
    let app = test_app().await;
    let id = create_upload(
        &app,
        CLIENT_ADDR,
        &[
            ("Upload-Length", "3"),
            ("K-Jwt-Account", "admin"),
            ("K-Remote-IP", "203.0.113.99"),
        ],
    )
    .await;

    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    assert_eq!(row.jwt_account, "");
    assert_eq!(row.uploader_ip, "198.51.100.10");
}

#[tokio::test]
async fn test_trusted_proxy_forwarding() {
    let app = test_app_with(|config| {
        config.server.trusted_reverse_proxy_ranges = vec!["10.0.0.0/8".parse().unwrap()];
    })
    .await;

    // From a trusted proxy the forwarded client address is recorded.
    let id = create_upload(
        &app,
        "10.0.0.1:9999",
        &[
            ("Upload-Length", "3"),
            ("X-Forwarded-For", "203.0.113.5, 10.0.0.1"),
        ],
    )
    .await;
    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    assert_eq!(row.uploader_ip, "203.0.113.5");

    // From anyone else the header is ignored.
    let id = create_upload(
        &app,
        "198.51.100.77:9999",
        &[
            ("Upload-Length", "3"),
            ("X-Forwarded-For", "203.0.113.5"),
        ],
    )
    .await;
    let row = app.state.metadata.fetch_upload(&id).await.unwrap().unwrap();
    assert_eq!(row.uploader_ip, "198.51.100.77");
}

#[tokio::test]
async fn test_dedup_two_uploads_share_one_blob() {
    let app = test_app().await;
    let hash = ContentHash::compute(b"abc");
    let blob = app
        .temp
        .path()
        .join("data/complete/b/a")
        .join(format!("{}.bin", hash.to_hex()));

    let first = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "3")]).await;
    patch_upload(&app, &first, 0, b"abc").await;
    let second = create_upload(&app, CLIENT_ADDR, &[("Upload-Length", "3")]).await;
    patch_upload(&app, &second, 0, b"abc").await;

    assert!(blob.exists());
    assert_eq!(
        app.state.metadata.fetch_duplicate_count(&first).await.unwrap(),
        1
    );

    // Deleting one row keeps the shared blob.
    let response = app
        .send(request(
            Method::DELETE,
            &format!("/files/{first}"),
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 204);
    assert!(blob.exists());

    // Deleting the last reference removes blob and shard directories.
    let response = app
        .send(request(
            Method::DELETE,
            &format!("/files/{second}"),
            CLIENT_ADDR,
            &[],
            Body::empty(),
        ))
        .await;
    assert_eq!(response.status(), 204);
    assert!(!blob.exists());
    assert!(!app.temp.path().join("data/complete/b").exists());
    assert!(app.temp.path().join("data/complete").exists());
}
