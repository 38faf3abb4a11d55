//! HTTP server: catalog downloads and request code queries.
//!
//! ## Endpoints
//!
//! - `GET /manifest` - JSON catalog, content-negotiated against the
//!   pre-compressed variants, with `Last-Modified`/`If-Modified-Since`
//! - `GET /manifest-bin` - packed binary catalog, same negotiation
//! - `GET /mrc?app_id=..&depot_id=..&manifest_id=..` - manifest request
//!   code, decimal ASCII body
//! - `/signin` - WebSocket sign-in bridge (see [`signin`])
//!
//! All catalog/MRC requests are answered only while the process is
//! *running*; during setup and shutdown they receive 503.

pub mod signin;

use crate::mrc::{self, MrcError};
use crate::state::{CatalogBuf, Ts3State};
use axum::Router;
use axum::body::Body;
use axum::extract::{RawQuery, State};
use axum::http::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, IF_MODIFIED_SINCE,
    LAST_MODIFIED,
};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use std::sync::Arc;

/// Builds the server's router.
///
/// The catalog and request code routes accept every method themselves:
/// the running-status check must come before the method check, and
/// method mismatches still carry a decimal status body.
pub fn router(state: Arc<Ts3State>) -> Router {
    Router::new()
        .route("/manifest", any(manifest_json))
        .route("/manifest-bin", any(manifest_bin))
        .route("/mrc", any(manifest_request_code))
        .route("/signin", any(signin::ws_handler))
        .fallback(not_found)
        .with_state(state)
}

/// Plain status response carrying the decimal code as its body.
fn status_response(status: StatusCode) -> Response {
    (
        status,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        status.as_u16().to_string(),
    )
        .into_response()
}

/// Rejects requests the endpoint never serves: anything while the
/// process is not *running* (503 takes priority over everything), then
/// anything that is not a GET.
fn gate(state: &Ts3State, method: &Method) -> Result<(), Response> {
    if !state.is_running() {
        return Err(status_response(StatusCode::SERVICE_UNAVAILABLE));
    }
    if method != Method::GET {
        return Err(status_response(StatusCode::METHOD_NOT_ALLOWED));
    }
    Ok(())
}

async fn not_found(State(state): State<Arc<Ts3State>>) -> Response {
    if !state.is_running() {
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    }
    status_response(StatusCode::NOT_FOUND)
}

// =============================================================================
// Catalog downloads
// =============================================================================

async fn manifest_json(
    State(state): State<Arc<Ts3State>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match gate(&state, &method) {
        Ok(()) => serve_catalog(&state, &headers, false),
        Err(rejection) => rejection,
    }
}

async fn manifest_bin(
    State(state): State<Arc<Ts3State>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    match gate(&state, &method) {
        Ok(()) => serve_catalog(&state, &headers, true),
        Err(rejection) => rejection,
    }
}

fn serve_catalog(state: &Ts3State, headers: &HeaderMap, binary: bool) -> Response {
    let (serialized, timestamp) = {
        let catalog = state.lock_catalog();
        (Arc::clone(&catalog.serialized), catalog.timestamp)
    };

    if let Some(since) = headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
    {
        if timestamp <= since {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    let buf = if binary {
        &serialized.bin
    } else {
        &serialized.json
    };
    let accept = headers
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let (body, encoding) = negotiate_encoding(buf, accept);

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            if binary {
                "application/octet-stream"
            } else {
                "application/json; charset=utf-8"
            },
        )
        .header(CACHE_CONTROL, "no-cache")
        .header(LAST_MODIFIED, format_http_date(timestamp));
    if let Some(encoding) = encoding {
        response = response.header(CONTENT_ENCODING, encoding);
    }
    response
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Selects the response encoding: the smallest pre-compressed variant
/// whose token appears in `Accept-Encoding`, falling back to identity.
fn negotiate_encoding(buf: &CatalogBuf, accept: &str) -> (Bytes, Option<&'static str>) {
    let mut body = &buf.identity;
    let mut encoding = None;
    if accept.is_empty() {
        return (body.clone(), encoding);
    }
    let mut candidates: Vec<(&Option<Bytes>, &'static str)> = vec![(&buf.deflate, "deflate")];
    #[cfg(feature = "brotli")]
    candidates.push((&buf.brotli, "br"));
    #[cfg(feature = "zstd")]
    candidates.push((&buf.zstd, "zstd"));

    for (candidate, token) in candidates {
        if let Some(candidate) = candidate {
            if accept.contains(token) && candidate.len() < body.len() {
                body = candidate;
                encoding = Some(token);
            }
        }
    }
    (body.clone(), encoding)
}

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Parses a strict IMF-fixdate (`Day, DD Mon YYYY HH:MM:SS GMT`).
fn parse_http_date(value: &str) -> Option<i64> {
    chrono::NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

fn format_http_date(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

// =============================================================================
// Request codes
// =============================================================================

/// Returns the raw value of a query argument, if present.
fn url_arg<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

async fn manifest_request_code(
    State(state): State<Arc<Ts3State>>,
    method: Method,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(rejection) = gate(&state, &method) {
        return rejection;
    }
    let query = query.unwrap_or_default();
    let Some(app_id) = url_arg(&query, "app_id").and_then(|v| v.parse::<u32>().ok()) else {
        return status_response(StatusCode::BAD_REQUEST);
    };
    let Some(depot_id) = url_arg(&query, "depot_id").and_then(|v| v.parse::<u32>().ok()) else {
        return status_response(StatusCode::BAD_REQUEST);
    };
    let Some(manifest_id) = url_arg(&query, "manifest_id").and_then(|v| v.parse::<u64>().ok())
    else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    match mrc::lookup(&state, app_id, depot_id, manifest_id).await {
        Ok((code, max_age)) => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, "text/plain; charset=utf-8".to_owned()),
                (CACHE_CONTROL, format!("max-age={max_age}")),
            ],
            code.to_string(),
        )
            .into_response(),
        Err(MrcError::Unlicensed) => status_response(StatusCode::UNAUTHORIZED),
        Err(MrcError::Timeout) => status_response(StatusCode::GATEWAY_TIMEOUT),
        Err(MrcError::Upstream(e)) => {
            tracing::error!(app_id, depot_id, manifest_id, error = %e, "Request code fetch failed");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        },
    }
}
