//! HTTP routes for the record server.
//!
//! - `GET /health`: health check (no auth required)
//! - `GET /records/{entity}?since=<rfc3339>`: list records
//! - `GET|POST|PUT|DELETE /records/{entity}/{id}`: single record
//!
//! Writes honor `X-Force-Overwrite: true`, which skips the version check.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use super::auth::{auth_middleware, ApiKeyStore, AuthMember};
use super::storage::{RecordStorage, RecordStorageError};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyStore>,
    pub storage: Arc<RecordStorage>,
    /// Serializes read-modify-write cycles on collection files.
    write_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(api_keys: ApiKeyStore, storage: RecordStorage) -> Self {
        Self {
            api_keys: Arc::new(api_keys),
            storage: Arc::new(storage),
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Builds the full router, auth included.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health));

    let protected_routes = Router::new()
        .route("/records/{entity}", get(list_records))
        .route(
            "/records/{entity}/{id}",
            get(get_record)
                .post(insert_record)
                .put(update_record)
                .delete(delete_record),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Error response with a JSON body
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": error, "message": message.into() }),
        }
    }

    fn not_found(entity: &str, id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No {} with id '{}'", entity, id),
        )
    }
}

impl From<RecordStorageError> for ApiError {
    fn from(e: RecordStorageError) -> Self {
        match e {
            RecordStorageError::Conflict(current) => Self {
                status: StatusCode::CONFLICT,
                body: json!({
                    "error": "conflict",
                    "message": format!("Record is at version {}", current.version),
                    "current": current.to_json(),
                }),
            },
            RecordStorageError::InvalidFamilyId(_)
            | RecordStorageError::InvalidEntity(_)
            | RecordStorageError::InvalidRecord(_) => {
                Self::new(StatusCode::BAD_REQUEST, "invalid_request", e.to_string())
            }
            RecordStorageError::IoError(..) | RecordStorageError::CorruptCollection(..) => {
                tracing::error!("Storage failure: {}", e);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "Failed to access record storage",
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Health check endpoint (no auth required)
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Deserialize)]
struct ListParams {
    since: Option<DateTime<Utc>>,
}

async fn list_records(
    State(state): State<AppState>,
    Extension(member): Extension<AuthMember>,
    Path(entity): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let records = state
        .storage
        .list(&member.family_id, &entity, params.since)?;
    let records: Vec<Value> = records.iter().map(|r| r.to_json()).collect();
    Ok(Json(json!({ "records": records })))
}

async fn get_record(
    State(state): State<AppState>,
    Extension(member): Extension<AuthMember>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    match state.storage.get(&member.family_id, &entity, &id)? {
        Some(record) => Ok(Json(record.to_json())),
        None => Err(ApiError::not_found(&entity, &id)),
    }
}

async fn insert_record(
    State(state): State<AppState>,
    Extension(member): Extension<AuthMember>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let data = object_body(body)?;
    let force = is_forced(&headers);

    let _guard = state.write_lock.lock().await;
    let record = state
        .storage
        .insert(&member.family_id, &entity, &id, data, force)?;

    tracing::info!(
        family_id = %member.family_id,
        member = %member.member,
        entity = %entity,
        id = %id,
        version = record.version,
        force,
        "Record inserted"
    );
    Ok((StatusCode::CREATED, Json(record.to_json())))
}

async fn update_record(
    State(state): State<AppState>,
    Extension(member): Extension<AuthMember>,
    Path((entity, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let data = object_body(body)?;
    let force = is_forced(&headers);

    let _guard = state.write_lock.lock().await;
    let record = state
        .storage
        .update(&member.family_id, &entity, &id, data, force)?;

    tracing::info!(
        family_id = %member.family_id,
        member = %member.member,
        entity = %entity,
        id = %id,
        version = record.version,
        force,
        "Record updated"
    );
    Ok(Json(record.to_json()))
}

async fn delete_record(
    State(state): State<AppState>,
    Extension(member): Extension<AuthMember>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let _guard = state.write_lock.lock().await;
    if state.storage.delete(&member.family_id, &entity, &id)? {
        tracing::info!(family_id = %member.family_id, entity = %entity, id = %id, "Record deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(&entity, &id))
    }
}

fn object_body(body: Value) -> Result<Map<String, Value>, ApiError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "Request body must be a JSON object",
        )),
    }
}

fn is_forced(headers: &HeaderMap) -> bool {
    headers
        .get("x-force-overwrite")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
