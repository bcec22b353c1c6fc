//! # Functions Proxy
//!
//! Forwards invocation traffic to the edge runtime. Authentication happens
//! before a request gets here.
//!
//! - `/functions/v1/<fn>/<rest>?<q>` reaches the runtime as `/<fn>/<rest>?<q>`
//! - Hop-by-hop headers are dropped in both directions
//! - Bodies stream through without buffering
//! - Transport failures become a `FunctionsRelayError` envelope

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, OriginalUri};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

/// Public mount point of the invocation API
pub const DEFAULT_PREFIX: &str = "/functions/v1";

/// Wait for a response when the function sets no `timeout_ms`
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(150);

pub const RELAY_ERROR: &str = "FunctionsRelayError";
pub const HTTP_ERROR: &str = "FunctionsHttpError";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// `{"error": <kind>, "message": <message>}` with the given status
pub fn error_envelope(status: StatusCode, kind: &str, message: &str) -> Response {
    (status, Json(json!({ "error": kind, "message": message }))).into_response()
}

pub fn relay_error(status: StatusCode, message: &str) -> Response {
    error_envelope(status, RELAY_ERROR, message)
}

/// Map a transport failure to a status and client-safe message.
/// `chain` is the lowercased error source chain.
pub fn classify_failure(chain: &str, timed_out: bool) -> (StatusCode, &'static str) {
    if chain.contains("connection refused") {
        (StatusCode::SERVICE_UNAVAILABLE, "edge runtime is not running")
    } else if timed_out || chain.contains("timed out") || chain.contains("timeout") {
        (StatusCode::GATEWAY_TIMEOUT, "function invocation timed out")
    } else {
        (StatusCode::BAD_GATEWAY, "failed to relay request to edge runtime")
    }
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ").to_lowercase()
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn end_to_end(headers: &HeaderMap) -> HeaderMap {
    // Headers named in Connection are hop-by-hop too
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !listed.iter().any(|l| l == name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Reverse proxy to one runtime instance
#[derive(Debug, Clone)]
pub struct FunctionsProxy {
    upstream: String,
    prefix: String,
    default_timeout: Duration,
    client: reqwest::Client,
}

impl FunctionsProxy {
    /// Proxy to `upstream` (`http://host:port`)
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into().trim_end_matches('/').to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            default_timeout: DEFAULT_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Strip the public prefix; the result always starts with `/`
    pub fn rewrite_path(&self, path: &str) -> String {
        let stripped = match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => path,
        };
        if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{}", stripped)
        }
    }

    /// Forward one request. `timeout` overrides the default wait.
    pub async fn forward(&self, request: Request<Body>, timeout: Option<Duration>) -> Response {
        let (parts, body) = request.into_parts();

        let uri = parts
            .extensions
            .get::<OriginalUri>()
            .map(|original| original.0.clone())
            .unwrap_or_else(|| parts.uri.clone());
        let path = self.rewrite_path(uri.path());
        let url = match uri.query() {
            Some(query) => format!("{}{}?{}", self.upstream, path, query),
            None => format!("{}{}", self.upstream, path),
        };

        let mut headers = end_to_end(&parts.headers);
        let client_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string());
        self.annotate(&mut headers, client_ip);
        headers.remove(header::HOST);

        let request_id = headers
            .get(&X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        debug!(
            op = "functions.proxy",
            method = %parts.method,
            path = %path,
            request_id = %request_id
        );

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .timeout(timeout.unwrap_or(self.default_timeout))
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        match upstream {
            Ok(response) => {
                let status = response.status();
                let headers = end_to_end(response.headers());
                let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
                *relayed.status_mut() = status;
                *relayed.headers_mut() = headers;
                relayed
            }
            Err(e) => {
                let (status, message) = classify_failure(&error_chain(&e), e.is_timeout());
                warn!(
                    op = "functions.proxy.failed",
                    path = %path,
                    request_id = %request_id,
                    status = status.as_u16(),
                    error = %e
                );
                relay_error(status, message)
            }
        }
    }

    /// Add request id and forwarding headers the client did not send
    fn annotate(&self, headers: &mut HeaderMap, client_ip: Option<String>) {
        if !headers.contains_key(&X_REQUEST_ID) {
            if let Ok(id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
                headers.insert(X_REQUEST_ID, id);
            }
        }
        if !headers.contains_key(&X_FORWARDED_FOR) {
            if let Some(ip) = client_ip.and_then(|ip| HeaderValue::from_str(&ip).ok()) {
                headers.insert(X_FORWARDED_FOR, ip);
            }
        }
        if !headers.contains_key(&X_FORWARDED_HOST) {
            if let Some(host) = headers.get(header::HOST).cloned() {
                headers.insert(X_FORWARDED_HOST, host);
            }
        }
        if !headers.contains_key(&X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
        }
    }
}
