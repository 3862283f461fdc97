//! Thin HTTP front-door: translates `/<prefix>/<service>/<method>` into a
//! dispatcher [`Envelope`], plus the fixed `/health` endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use chrono::Utc;
use relay_broker::Dispatcher;
use relay_proto::{DispatchError, Envelope};
use serde::Serialize;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub request_timeout: Duration,
}

/// Build the gateway's router. `path_prefix` is fixed at startup from
/// config; any request shape outside `/<prefix>/<service>/<method>` or
/// `/health` falls through to [`fallback_bad_shape`], returning 400.
pub fn router(state: AppState, path_prefix: &str) -> Router {
    let dispatch_path = format!("/{path_prefix}/{{service}}/{{method}}");
    Router::new()
        .route(&dispatch_path, any(dispatch_handler))
        .route("/health", get(health_handler))
        .fallback(fallback_bad_shape)
        .with_state(state)
}

async fn dispatch_handler(
    State(state): State<AppState>,
    Path((service, method)): Path<(String, String)>,
    method_verb: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = build_envelope(service, method, method_verb, &headers, body, state.request_timeout);
    match state.dispatcher.dispatch(envelope).await {
        Ok(resp) => envelope_response(resp.status, resp.body, &resp.metadata),
        Err(err) => error_response(&err),
    }
}

/// Lift an HTTP request into the language-neutral [`Envelope`] the
/// dispatcher expects. Headers are lifted key-by-key; a repeated header's
/// first value wins. The HTTP verb rides along as `metadata["http-method"]`.
fn build_envelope(
    service: String,
    method: String,
    http_method: Method,
    headers: &HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Envelope {
    let mut metadata = BTreeMap::new();
    for name in headers.keys() {
        if metadata.contains_key(name.as_str()) {
            continue; // first value wins
        }
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            metadata.insert(name.as_str().to_string(), value.to_string());
        }
    }
    metadata.insert("http-method".to_string(), http_method.as_str().to_string());

    Envelope {
        request_id: uuid::Uuid::new_v4().to_string(),
        service,
        method,
        body: body.to_vec(),
        metadata,
        deadline: Instant::now() + timeout,
    }
}

/// Render a successful dispatch outcome. `Content-Type` is forced to
/// `application/json` regardless of the backend payload's actual shape;
/// the dispatcher's status is used verbatim as the HTTP status.
fn envelope_response(status: u16, body: Vec<u8>, metadata: &BTreeMap<String, String>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let mut response = (status, body).into_response();
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
    for (key, value) in metadata {
        if let (Ok(name), Ok(val)) = (
            axum::http::HeaderName::try_from(key.as_str()),
            axum::http::HeaderValue::try_from(value.as_str()),
        ) {
            response.headers_mut().insert(name, val);
        }
    }
    response
}

/// Render a dispatch error as a JSON body carrying a human-readable reason,
/// at the status [`DispatchError::http_status`] assigns the error kind.
fn error_response(err: &DispatchError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": err.to_string() });
    let mut response = (status, axum::Json(body)).into_response();
    response
        .headers_mut()
        .insert(axum::http::header::CONTENT_TYPE, "application/json".parse().unwrap());
    response
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    time: String,
}

async fn health_handler() -> Response {
    let body = HealthBody {
        status: "healthy",
        time: Utc::now().to_rfc3339(),
    };
    (StatusCode::OK, axum::Json(body)).into_response()
}

/// Any path shape that doesn't match the fixed dispatch route or `/health`
/// falls through to this: a flat 400.
async fn fallback_bad_shape() -> Response {
    let body = serde_json::json!({ "error": "no route matches this path" });
    (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
}
