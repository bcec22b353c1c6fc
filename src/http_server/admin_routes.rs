//! Admin API Routes
//!
//! Function, secret, config and runtime management. Session auth is the
//! embedding server's job; nothing here checks credentials.
//!
//! Errors are `{"error": <message>, "code": <status>}`. Server-side
//! failures return the status reason only; the detail goes to the log.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::functions::function::FunctionMetadata;
use crate::functions::runtime::RuntimeStatus;
use crate::functions::store::SecretRecord;
use crate::functions::templates::Template;
use crate::functions::{FunctionError, FunctionFile, FunctionInfo, Service};

// ==================
// Shared State
// ==================

/// Admin state shared across handlers
pub struct AdminState {
    pub service: Arc<Service>,
    /// Server shutdown; runtime restarts abort when it fires
    pub shutdown: CancellationToken,
}

impl AdminState {
    pub fn new(service: Arc<Service>, shutdown: CancellationToken) -> Self {
        Self { service, shutdown }
    }
}

// ==================
// Request/Response Types
// ==================

#[derive(Debug, Serialize)]
pub struct FunctionsListResponse {
    pub functions: Vec<FunctionInfo>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateFunctionRequest {
    pub name: String,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FilesListResponse {
    pub files: Vec<FunctionFile>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct FileContentResponse {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SecretsListResponse {
    pub secrets: Vec<SecretRecord>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct SetSecretRequest {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct ConfigEntryResponse {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct ReloadSecretsResponse {
    pub reloaded: usize,
    /// Secrets reach the runtime only on the next restart
    pub restart_required: bool,
}

#[derive(Debug, Serialize)]
pub struct TemplatesResponse {
    pub templates: Vec<Template>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(e: FunctionError) -> ApiError {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = if e.is_client_error() {
        e.to_string()
    } else {
        error!(op = "admin.request.failed", status = status.as_u16(), error = %e);
        status
            .canonical_reason()
            .unwrap_or("Internal Server Error")
            .to_string()
    };
    (
        status,
        Json(ErrorResponse {
            error: message,
            code: status.as_u16(),
        }),
    )
}

// ==================
// Admin Routes
// ==================

/// Create admin routes; mount under the admin prefix
pub fn admin_routes(state: Arc<AdminState>) -> Router {
    Router::new()
        // Functions
        .route("/functions", get(list_functions_handler).post(create_function_handler))
        .route(
            "/functions/:name",
            get(get_function_handler).delete(delete_function_handler),
        )
        .route(
            "/functions/:name/metadata",
            get(get_metadata_handler).put(set_metadata_handler),
        )
        .route("/functions/:name/files", get(list_files_handler))
        .route(
            "/functions/:name/files/*path",
            get(read_file_handler)
                .put(write_file_handler)
                .delete(delete_file_handler),
        )
        // Secrets
        .route("/secrets", get(list_secrets_handler).post(set_secret_handler))
        .route("/secrets/:name", delete(delete_secret_handler))
        // Config
        .route("/config", get(get_all_config_handler))
        .route(
            "/config/:key",
            get(get_config_handler)
                .put(set_config_handler)
                .delete(delete_config_handler),
        )
        // Runtime
        .route("/runtime/status", get(runtime_status_handler))
        .route("/runtime/restart", post(restart_runtime_handler))
        .route("/runtime/reload-secrets", post(reload_secrets_handler))
        // Templates
        .route("/templates", get(list_templates_handler))
        .with_state(state)
}

// ==================
// Function Handlers
// ==================

async fn list_functions_handler(
    State(state): State<Arc<AdminState>>,
) -> ApiResult<Json<FunctionsListResponse>> {
    let functions = state.service.list_functions().map_err(api_error)?;
    Ok(Json(FunctionsListResponse {
        total: functions.len(),
        functions,
    }))
}

async fn create_function_handler(
    State(state): State<Arc<AdminState>>,
    Json(request): Json<CreateFunctionRequest>,
) -> ApiResult<(StatusCode, Json<FunctionInfo>)> {
    let info = state
        .service
        .create_function(&request.name, request.template.as_deref())
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn get_function_handler(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<FunctionInfo>> {
    state.service.get_function(&name).map(Json).map_err(api_error)
}

async fn delete_function_handler(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_function(&name).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_metadata_handler(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<FunctionMetadata>> {
    state.service.get_metadata(&name).map(Json).map_err(api_error)
}

async fn set_metadata_handler(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
    Json(metadata): Json<FunctionMetadata>,
) -> ApiResult<Json<FunctionMetadata>> {
    state
        .service
        .set_metadata(&name, metadata)
        .map(Json)
        .map_err(api_error)
}

// ==================
// File Handlers
// ==================

async fn list_files_handler(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<FilesListResponse>> {
    let files = state.service.list_files(&name).map_err(api_error)?;
    Ok(Json(FilesListResponse {
        total: files.len(),
        files,
    }))
}

async fn read_file_handler(
    State(state): State<Arc<AdminState>>,
    Path((name, path)): Path<(String, String)>,
) -> ApiResult<Json<FileContentResponse>> {
    let content = state.service.read_file(&name, &path).map_err(api_error)?;
    Ok(Json(FileContentResponse { path, content }))
}

async fn write_file_handler(
    State(state): State<Arc<AdminState>>,
    Path((name, path)): Path<(String, String)>,
    Json(request): Json<WriteFileRequest>,
) -> ApiResult<Json<FunctionFile>> {
    state
        .service
        .write_file(&name, &path, &request.content)
        .map(Json)
        .map_err(api_error)
}

async fn delete_file_handler(
    State(state): State<Arc<AdminState>>,
    Path((name, path)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.service.delete_file(&name, &path).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================
// Secret Handlers
// ==================

async fn list_secrets_handler(
    State(state): State<Arc<AdminState>>,
) -> ApiResult<Json<SecretsListResponse>> {
    let secrets = state.service.list_secrets().map_err(api_error)?;
    Ok(Json(SecretsListResponse {
        total: secrets.len(),
        secrets,
    }))
}

async fn set_secret_handler(
    State(state): State<Arc<AdminState>>,
    Json(request): Json<SetSecretRequest>,
) -> ApiResult<(StatusCode, Json<SecretRecord>)> {
    state
        .service
        .set_secret(&request.name, &request.value)
        .map_err(api_error)?;
    let record = state
        .service
        .list_secrets()
        .map_err(api_error)?
        .into_iter()
        .find(|s| s.name == request.name)
        .ok_or_else(|| api_error(FunctionError::Internal("secret vanished after write".into())))?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn delete_secret_handler(
    State(state): State<Arc<AdminState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.service.delete_secret(&name).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ==================
// Config Handlers
// ==================

async fn get_all_config_handler(
    State(state): State<Arc<AdminState>>,
) -> ApiResult<Json<BTreeMap<String, String>>> {
    state.service.get_all_config().map(Json).map_err(api_error)
}

async fn get_config_handler(
    State(state): State<Arc<AdminState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<ConfigEntryResponse>> {
    let value = state
        .service
        .get_config(&key)
        .map_err(api_error)?
        .ok_or_else(|| api_error(FunctionError::ConfigNotFound(key.clone())))?;
    Ok(Json(ConfigEntryResponse { key, value }))
}

async fn set_config_handler(
    State(state): State<Arc<AdminState>>,
    Path(key): Path<String>,
    Json(request): Json<SetConfigRequest>,
) -> ApiResult<Json<ConfigEntryResponse>> {
    state
        .service
        .set_config(&key, &request.value)
        .map_err(api_error)?;
    Ok(Json(ConfigEntryResponse {
        key,
        value: request.value,
    }))
}

async fn delete_config_handler(
    State(state): State<Arc<AdminState>>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    if state.service.delete_config(&key).map_err(api_error)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(FunctionError::ConfigNotFound(key.clone())))
    }
}

// ==================
// Runtime Handlers
// ==================

async fn runtime_status_handler(
    State(state): State<Arc<AdminState>>,
) -> ApiResult<Json<RuntimeStatus>> {
    state.service.runtime_status().map(Json).map_err(api_error)
}

async fn restart_runtime_handler(
    State(state): State<Arc<AdminState>>,
) -> ApiResult<Json<RuntimeStatus>> {
    state
        .service
        .restart(&state.shutdown.child_token())
        .await
        .map_err(api_error)?;
    state.service.runtime_status().map(Json).map_err(api_error)
}

async fn reload_secrets_handler(
    State(state): State<Arc<AdminState>>,
) -> ApiResult<Json<ReloadSecretsResponse>> {
    let reloaded = state.service.reload_secrets().map_err(api_error)?;
    Ok(Json(ReloadSecretsResponse {
        reloaded,
        restart_required: true,
    }))
}

async fn list_templates_handler(State(state): State<Arc<AdminState>>) -> Json<TemplatesResponse> {
    Json(TemplatesResponse {
        templates: state.service.templates().to_vec(),
    })
}
