//! HTTP ingestion API: schedule and cancel jobs.

pub mod auth;

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{delete, get, put},
};
use chrono::Utc;
use secrecy::SecretString;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{info, warn};

use crate::error::{DatabaseError, Error, ValidationError};
use crate::mail::{Job, MailRequest};
use crate::store::JobStore;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub secret: SecretString,
}

/// JSON body of every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnVal {
    pub success: bool,
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Rows removed, on delete routes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct JobDelete {
    #[serde(default)]
    job_key: String,
}

#[derive(Debug, Deserialize)]
struct SubDelete {
    #[serde(default)]
    sub_key: String,
}

#[derive(Debug, Deserialize)]
struct MissiveDelete {
    #[serde(default)]
    missive_key: String,
}

/// Build the Axum router with the ingestion routes.
pub fn mail_routes(store: Arc<dyn JobStore>, secret: SecretString) -> Router {
    let state = AppState { store, secret };

    Router::new()
        .route("/health", get(health))
        .route("/job", put(schedule_job).delete(delete_job))
        .route("/sub", delete(delete_subscription))
        .route("/missive", delete(cancel_missive))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "scheduled-mailer"
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn schedule_job(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let result = async {
        authorize(&state, &method, &uri, &headers)?;
        let request: MailRequest = decode(&body)?;
        let job = Job::from_request(request)?;
        state.store.insert(&job).await?;
        info!(job_key = %job.job_key, idem_key = %job.idem_key(), send_at = job.send_at, "Scheduled job");
        Ok::<_, Error>(None)
    }
    .await;
    respond(result)
}

async fn delete_job(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let result = async {
        authorize(&state, &method, &uri, &headers)?;
        let request: JobDelete = decode(&body)?;
        let key = required(request.job_key, "job_key")?;
        let deleted = state.store.delete_by_job_key(&key).await?;
        info!(job_key = %key, deleted, "Deleted job");
        Ok::<_, Error>(Some(deleted))
    }
    .await;
    respond(result)
}

async fn delete_subscription(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let result = async {
        authorize(&state, &method, &uri, &headers)?;
        let request: SubDelete = decode(&body)?;
        let key = required(request.sub_key, "sub_key")?;
        let deleted = state.store.delete_by_subscription_key(&key).await?;
        info!(sub_key = %key, deleted, "Deleted subscription jobs");
        Ok::<_, Error>(Some(deleted))
    }
    .await;
    respond(result)
}

async fn cancel_missive(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let result = async {
        authorize(&state, &method, &uri, &headers)?;
        let request: MissiveDelete = decode(&body)?;
        let key = required(request.missive_key, "missive_key")?;
        let deleted = state.store.cancel_by_missive_key(&key).await?;
        info!(missive_key = %key, deleted, "Cancelled missive");
        Ok::<_, Error>(Some(deleted))
    }
    .await;
    respond(result)
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn authorize(state: &AppState, method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<(), Error> {
    auth::verify(
        &state.secret,
        headers,
        uri.path(),
        method.as_str(),
        Utc::now().timestamp(),
    )
    .inspect_err(|e| warn!(path = uri.path(), method = %method, "Rejected request: {e}"))?;
    Ok(())
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ValidationError> {
    serde_json::from_slice(body).map_err(|e| ValidationError::MalformedBody(e.to_string()))
}

fn required(value: String, field: &'static str) -> Result<String, ValidationError> {
    if value.is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(value)
    }
}

/// HTTP status for a failed request.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::Validation(_) | Error::Codec(_) => StatusCode::BAD_REQUEST,
        Error::Database(DatabaseError::Conflict { .. }) => StatusCode::CONFLICT,
        Error::Database(DatabaseError::Codec { .. }) => StatusCode::BAD_REQUEST,
        Error::Database(_) | Error::Config(_) | Error::Transport(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn respond(result: Result<Option<u64>, Error>) -> (StatusCode, Json<ReturnVal>) {
    match result {
        Ok(deleted) => (
            StatusCode::OK,
            Json(ReturnVal {
                success: true,
                code: StatusCode::OK.as_u16(),
                error: None,
                deleted,
            }),
        ),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!(error = %e, "Request failed");
            }
            (
                status,
                Json(ReturnVal {
                    success: false,
                    code: status.as_u16(),
                    error: Some(e.to_string()),
                    deleted: None,
                }),
            )
        }
    }
}
