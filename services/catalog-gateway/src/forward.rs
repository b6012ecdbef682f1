//! Forwarding to the catalog upstream
//!
//! Everything the guard lets through and no auth route claims ends up here.
//! Hop-by-hop headers are stripped in both directions. Inbound
//! `x-session-*` headers are dropped and replaced with the subject the guard
//! resolved, so the upstream can trust them.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use identity::Session;
use reqwest::Method;
use tracing::{error, instrument, warn};

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const SESSION_SUBJECT_HEADER: &str = "x-session-subject";
pub const SESSION_EMAIL_HEADER: &str = "x-session-email";
const SESSION_HEADER_PREFIX: &str = "x-session-";

/// Largest request body buffered for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct ForwardState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
}

impl ForwardState {
    pub fn new(upstream_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            upstream_url: upstream_url.trim_end_matches('/').to_owned(),
            timeout,
        }
    }
}

/// `{"error":{"type":"gateway_error","message":"...","request_id":"req_..."}}`
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "gateway_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Forward one request upstream on behalf of `session`.
///
/// Timeouts are retried twice with a fixed 100ms backoff, for GET and HEAD only.
#[instrument(
    skip_all,
    fields(
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path()
    )
)]
pub async fn forward_request(
    state: &ForwardState,
    request: Request<Body>,
    session: Option<&Session>,
    request_id: String,
) -> Response {
    let method = request.method().clone();
    let upstream_url = match request.uri().path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url, pq),
        None => state.upstream_url.clone(),
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str()) && !is_session_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Some(session) = session {
        inject_session(&mut headers, session);
    }

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read request body");
            metrics::record_upstream_error("request_body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    let attempts = if is_retryable(&method) { MAX_ATTEMPTS } else { 1 };
    for attempt in 0..attempts {
        if attempt > 0 {
            warn!(attempt, "retrying after upstream timeout");
            tokio::time::sleep(RETRY_DELAY).await;
        }

        let req = state
            .client
            .request(method.clone(), &upstream_url)
            .headers(headers.clone())
            .timeout(state.timeout)
            .body(body_bytes.clone());

        match req.send().await {
            Ok(upstream_response) => {
                return relay(upstream_response, &request_id).await;
            }
            Err(e) if e.is_timeout() && attempt + 1 < attempts => continue,
            Err(e) if e.is_timeout() => {
                error!(error = %e, attempts, "upstream timeout");
                metrics::record_upstream_error("timeout");
                return error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    &format!(
                        "upstream timeout after {}s ({attempts} attempts)",
                        state.timeout.as_secs()
                    ),
                    &request_id,
                );
            }
            Err(e) => {
                error!(error = %e, "upstream request failed");
                metrics::record_upstream_error("connection");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream error: {e}"),
                    &request_id,
                );
            }
        }
    }

    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "unexpected retry exhaustion",
        &request_id,
    )
}

async fn relay(upstream_response: reqwest::Response, request_id: &str) -> Response {
    let status = upstream_response.status();
    let resp_headers = upstream_response.headers().clone();

    let resp_body = match upstream_response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to read upstream response body");
            metrics::record_upstream_error("response_body");
            return error_response(
                StatusCode::BAD_GATEWAY,
                &format!("upstream response read error: {e}"),
                request_id,
            );
        }
    };

    let mut response = Response::builder().status(status);
    for (name, value) in &resp_headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response.body(Body::from(resp_body)).unwrap_or_else(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("response build error: {e}"),
            request_id,
        )
    })
}

fn inject_session(headers: &mut reqwest::header::HeaderMap, session: &Session) {
    match HeaderValue::from_str(&session.subject_id) {
        Ok(v) => {
            headers.insert(SESSION_SUBJECT_HEADER, v);
        }
        Err(e) => warn!(error = %e, "subject id not representable as a header"),
    }
    if let Some(email) = &session.email {
        match HeaderValue::from_str(email) {
            Ok(v) => {
                headers.insert(SESSION_EMAIL_HEADER, v);
            }
            Err(e) => warn!(error = %e, "email not representable as a header"),
        }
    }
}

fn is_retryable(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_session_header(name: &str) -> bool {
    name.len() >= SESSION_HEADER_PREFIX.len()
        && name[..SESSION_HEADER_PREFIX.len()].eq_ignore_ascii_case(SESSION_HEADER_PREFIX)
}
