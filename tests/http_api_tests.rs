//! HTTP API integration tests.
//!
//! Drives the router directly against the scripted CM backend: catalog
//! downloads, conditional GET, content negotiation, request codes and the
//! error paths around them.

#[path = "common.rs"]
mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use common::{connector_with_cs2, running_state, wait_until};
use std::io::Read;
use std::sync::Arc;
use tek_s3::cm::sim::{SimApp, SimConnector};
use tek_s3::persist::LoadedState;
use tek_s3::state::Ts3State;
use tek_s3::{http, manifest, session};
use tower::ServiceExt;

async fn get(
    router: &axum::Router,
    uri: &str,
    headers: &[(header::HeaderName, &str)],
) -> axum::response::Response {
    let mut request = Request::builder().uri(uri);
    for (name, value) in headers {
        request = request.header(name, *value);
    }
    router
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

// =============================================================================
// Catalog downloads
// =============================================================================

#[tokio::test]
async fn cold_start_without_accounts_serves_empty_catalog() {
    let state = running_state(SimConnector::new(), &[]).await;
    let router = http::router(Arc::clone(&state));

    let response = get(&router, "/manifest", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json; charset=utf-8"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let last_modified = response.headers()[header::LAST_MODIFIED]
        .to_str()
        .unwrap()
        .to_owned();
    let parsed = chrono::NaiveDateTime::parse_from_str(&last_modified, "%a, %d %b %Y %H:%M:%S GMT")
        .unwrap()
        .and_utc()
        .timestamp();
    assert!((parsed - common::unix_now()).abs() < 60);

    assert_eq!(
        body_bytes(response).await,
        br#"{"apps":{},"depot_keys":{}}"#.to_vec()
    );
}

#[tokio::test]
async fn conditional_get_yields_304_with_empty_body() {
    let state = running_state(SimConnector::new(), &[]).await;
    let router = http::router(Arc::clone(&state));

    let first = get(&router, "/manifest", &[]).await;
    let last_modified = first.headers()[header::LAST_MODIFIED]
        .to_str()
        .unwrap()
        .to_owned();

    let second = get(
        &router,
        "/manifest",
        &[(header::IF_MODIFIED_SINCE, last_modified.as_str())],
    )
    .await;
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert!(body_bytes(second).await.is_empty());

    // An older If-Modified-Since still gets the full catalog
    let third = get(
        &router,
        "/manifest",
        &[(header::IF_MODIFIED_SINCE, "Wed, 01 Jan 2020 00:00:00 GMT")],
    )
    .await;
    assert_eq!(third.status(), StatusCode::OK);

    // Malformed dates are ignored
    let fourth = get(&router, "/manifest", &[(header::IF_MODIFIED_SINCE, "yesterday")]).await;
    assert_eq!(fourth.status(), StatusCode::OK);
}

/// A backend big enough that every codec beats identity.
fn large_connector() -> SimConnector {
    let connector = SimConnector::new();
    for n in 0..60u32 {
        connector.grant_app(
            1001,
            n,
            SimApp {
                id: 1000 + n,
                name: format!("Sample Application With A Longish Name #{n}"),
                depots: vec![10_000 + n, 20_000 + n],
                ..SimApp::default()
            },
        );
    }
    connector
}

#[cfg(feature = "brotli")]
#[tokio::test]
async fn content_negotiation_picks_brotli_for_br_token() {
    let state = running_state(large_connector(), &[1001]).await;
    let router = http::router(Arc::clone(&state));

    let identity = body_bytes(get(&router, "/manifest", &[]).await).await;
    assert!(identity.len() >= 2048);

    let response = get(&router, "/manifest", &[(header::ACCEPT_ENCODING, "br, gzip")]).await;
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "br");
    let compressed = body_bytes(response).await;
    assert!(compressed.len() < identity.len());

    let mut decompressed = Vec::new();
    brotli::Decompressor::new(&compressed[..], 4096)
        .read_to_end(&mut decompressed)
        .unwrap();
    assert_eq!(decompressed, identity);
}

#[tokio::test]
async fn content_negotiation_falls_back_to_identity() {
    let state = running_state(large_connector(), &[1001]).await;
    let router = http::router(Arc::clone(&state));

    // gzip is not a variant the server precomputes
    let response = get(&router, "/manifest", &[(header::ACCEPT_ENCODING, "gzip")]).await;
    assert!(!response.headers().contains_key(header::CONTENT_ENCODING));

    let response = get(&router, "/manifest", &[(header::ACCEPT_ENCODING, "deflate")]).await;
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "deflate");
    let compressed = body_bytes(response).await;
    let mut decompressed = Vec::new();
    flate2::read::ZlibDecoder::new(&compressed[..])
        .read_to_end(&mut decompressed)
        .unwrap();
    let identity = body_bytes(get(&router, "/manifest", &[]).await).await;
    assert_eq!(decompressed, identity);
}

#[tokio::test]
async fn binary_catalog_round_trips_over_http() {
    let state = running_state(connector_with_cs2(), &[1001]).await;
    // Keys are fetched and published after the running transition
    wait_until(|| {
        let catalog = state.lock_catalog();
        manifest::parse_bin(&catalog.serialized.bin.identity)
            .is_some_and(|parsed| parsed.depot_keys.len() == 2)
    })
    .await;
    let router = http::router(Arc::clone(&state));

    let response = get(&router, "/manifest-bin", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
    let parsed = manifest::parse_bin(&body_bytes(response).await).expect("CRC must hold");
    assert_eq!(parsed.apps.len(), 1);
    assert_eq!(parsed.apps[0].name, "Counter-Strike 2");
    assert_eq!(parsed.apps[0].pics_at, 0xFEED_F00D);
    assert_eq!(parsed.apps[0].depots, vec![731, 732]);
    assert_eq!(parsed.depot_keys.len(), 2);
}

// =============================================================================
// Status handling
// =============================================================================

async fn request_with_method(
    router: &axum::Router,
    method: Method,
    uri: &str,
) -> axum::response::Response {
    router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn requests_during_setup_get_503() {
    // No bootstrap: the process stays in setup
    let state = Ts3State::new(Arc::new(SimConnector::new()), None);
    let router = http::router(Arc::clone(&state));

    for uri in ["/manifest", "/manifest-bin", "/mrc?app_id=1&depot_id=2&manifest_id=3", "/nope"] {
        let response = get(&router, uri, &[]).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        assert_eq!(body_bytes(response).await, b"503".to_vec(), "{uri}");
    }

    // The status gate outranks the method check: a mismatched method
    // during setup is still 503, not 405
    for uri in ["/manifest", "/mrc?app_id=1&depot_id=2&manifest_id=3"] {
        let response = request_with_method(&router, Method::POST, uri).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        assert_eq!(body_bytes(response).await, b"503".to_vec(), "{uri}");
    }
}

#[tokio::test]
async fn unknown_paths_and_methods_are_rejected() {
    let state = running_state(SimConnector::new(), &[]).await;
    let router = http::router(Arc::clone(&state));

    let response = get(&router, "/other", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_bytes(response).await, b"404".to_vec());

    for (method, uri) in [
        (Method::POST, "/manifest"),
        (Method::PUT, "/manifest-bin"),
        (Method::DELETE, "/mrc?app_id=1&depot_id=2&manifest_id=3"),
    ] {
        let response = request_with_method(&router, method.clone(), uri).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method} {uri}");
        // Every status response except 304 carries its decimal code
        assert_eq!(body_bytes(response).await, b"405".to_vec(), "{method} {uri}");
    }
}

// =============================================================================
// Request codes
// =============================================================================

#[tokio::test]
async fn mrc_is_cached_between_requests() {
    let connector = connector_with_cs2();
    let probe = connector.clone();
    let state = running_state(connector, &[1001]).await;
    let router = http::router(Arc::clone(&state));

    let uri = "/mrc?app_id=730&depot_id=731&manifest_id=1234567890123";
    let first = get(&router, uri, &[]).await;
    assert_eq!(first.status(), StatusCode::OK);
    let first_age = max_age(&first);
    let first_body = body_bytes(first).await;
    let code: u64 = std::str::from_utf8(&first_body).unwrap().parse().unwrap();
    assert_eq!(probe.mrc_request_count(), 1);

    let second = get(&router, uri, &[]).await;
    assert_eq!(second.status(), StatusCode::OK);
    let second_age = max_age(&second);
    assert_eq!(body_bytes(second).await, code.to_string().as_bytes());
    // Served from cache: no new CM request, strictly shorter lifetime
    assert_eq!(probe.mrc_request_count(), 1);
    assert!(second_age < first_age);
    assert!(first_age <= 300);
}

fn max_age(response: &axum::response::Response) -> u64 {
    response.headers()[header::CACHE_CONTROL]
        .to_str()
        .unwrap()
        .strip_prefix("max-age=")
        .unwrap()
        .parse()
        .unwrap()
}

#[tokio::test]
async fn mrc_parameter_validation() {
    let state = running_state(connector_with_cs2(), &[1001]).await;
    let router = http::router(Arc::clone(&state));

    for uri in [
        "/mrc",
        "/mrc?app_id=730&depot_id=731",
        "/mrc?app_id=abc&depot_id=731&manifest_id=1",
        "/mrc?app_id=-730&depot_id=731&manifest_id=1",
        "/mrc?app_id=730&depot_id=99999999999&manifest_id=1",
        "/mrc?app_id=730&depot_id=731&manifest_id=",
    ] {
        let response = get(&router, uri, &[]).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn mrc_for_unowned_depot_is_401() {
    let state = running_state(connector_with_cs2(), &[1001]).await;
    let router = http::router(Arc::clone(&state));

    let response = get(&router, "/mrc?app_id=730&depot_id=777&manifest_id=1", &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let response = get(&router, "/mrc?app_id=777&depot_id=731&manifest_id=1", &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mrc_upstream_timeout_is_504() {
    let connector = connector_with_cs2();
    connector.set_mrc_delay(std::time::Duration::from_millis(2500));
    let state = running_state(connector, &[1001]).await;
    let router = http::router(Arc::clone(&state));

    let response = get(&router, "/mrc?app_id=730&depot_id=731&manifest_id=5", &[]).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

// =============================================================================
// Account invalidation
// =============================================================================

#[tokio::test]
async fn invalidated_account_disappears_from_manifest() {
    let connector = SimConnector::new();
    connector.grant_app(
        1001,
        100,
        SimApp {
            id: 730,
            name: "CS2".into(),
            depots: vec![731],
            ..SimApp::default()
        },
    );
    connector.grant_app(
        1002,
        200,
        SimApp {
            id: 440,
            name: "TF2".into(),
            depots: vec![441],
            ..SimApp::default()
        },
    );
    connector.revoke(1002);

    let mut loaded = LoadedState::default();
    for &steam_id in &[1001u64, 1002] {
        let token = connector.issue_token(steam_id, common::far_future(), false);
        loaded
            .accounts
            .push((token.clone(), tek_s3::cm::TokenInfo::parse(&token).unwrap()));
    }
    let state = Ts3State::new(Arc::new(connector), None);
    session::bootstrap(&state, loaded);
    wait_until(|| state.is_running()).await;
    wait_until(|| state.lock_catalog().accounts.len() == 1).await;

    let router = http::router(Arc::clone(&state));
    let body = body_bytes(get(&router, "/manifest", &[]).await).await;
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(doc["apps"].get("730").is_some());
    assert!(doc["apps"].get("440").is_none());
    // And the process kept serving
    assert!(state.is_running());
    assert_eq!(state.exit_code(), 0);
}
