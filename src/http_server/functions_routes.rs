//! Functions Invocation Routes
//!
//! `ANY {prefix}/:function[/*rest]` is gated, then proxied to the edge
//! runtime:
//!
//! 1. runtime unhealthy: 502, nothing is forwarded
//! 2. no such function on disk: 404
//! 3. `verify_jwt` (default true, also when metadata can't be read):
//!    a valid `Authorization: Bearer` token is required, else 401
//! 4. forward with the function's `timeout_ms`, if any
//!
//! `OPTIONS` is answered here with permissive CORS and never needs a token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, MethodRouter},
    Router,
};
use tracing::warn;

use crate::auth::JwtValidator;
use crate::functions::function::FunctionMetadata;
use crate::functions::proxy::{error_envelope, relay_error, FunctionsProxy, HTTP_ERROR};
use crate::functions::Service;

// ==================
// Shared State
// ==================

/// State shared by invocation handlers
pub struct FunctionsState {
    pub service: Arc<Service>,
    pub proxy: FunctionsProxy,
    pub jwt: JwtValidator,
}

impl FunctionsState {
    pub fn new(service: Arc<Service>, proxy: FunctionsProxy, jwt: JwtValidator) -> Self {
        Self {
            service,
            proxy,
            jwt,
        }
    }
}

pub const CORS_ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";

// ==================
// Functions Routes
// ==================

fn invocation() -> MethodRouter<Arc<FunctionsState>> {
    any(invoke_handler).options(preflight_handler)
}

/// Create invocation routes; mount under the functions prefix
pub fn functions_routes(state: Arc<FunctionsState>) -> Router {
    Router::new()
        .route("/:function", invocation())
        .route("/:function/*rest", invocation())
        .with_state(state)
}

// ==================
// Handlers
// ==================

async fn invoke_handler(
    State(state): State<Arc<FunctionsState>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Response {
    let Some(name) = params.get("function") else {
        return error_envelope(StatusCode::NOT_FOUND, HTTP_ERROR, "function not found");
    };

    if !state.service.is_healthy() {
        return relay_error(StatusCode::BAD_GATEWAY, "edge runtime is not healthy");
    }

    if !state.service.function_exists(name) {
        return error_envelope(
            StatusCode::NOT_FOUND,
            HTTP_ERROR,
            &format!("function '{}' not found", name),
        );
    }

    let metadata = state.service.store().get_metadata(name).unwrap_or_else(|e| {
        warn!(op = "functions.metadata.read_failed", function = %name, error = %e);
        FunctionMetadata::defaults(name)
    });

    if metadata.verify_jwt {
        if let Err(e) = state.jwt.validate_headers(request.headers()) {
            return error_envelope(StatusCode::UNAUTHORIZED, HTTP_ERROR, &e.to_string());
        }
    }

    let timeout = metadata.timeout_ms.map(Duration::from_millis);
    state.proxy.forward(request, timeout).await
}

async fn preflight_handler() -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}
