//! HTTP ingress: upload intake, raw notifications, topic publishing and
//! read-only inspection of records and queues.

use crate::config::ApiConfig;
use crate::messages::UploadNotification;
use crate::model::PhotoRecord;
use crate::objects::content_type_for_key;
use crate::pipeline::{Pipeline, QueueStatus};
use crate::transport::{MessageAttributes, OutgoingMessage};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

/// Upload request: the object body is optional so callers can register
/// objects that already sit in the bucket
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub key: String,
    #[serde(default)]
    pub content_base64: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Topic publish request
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Message body; JSON values other than strings are serialized compactly
    pub message: Value,
    #[serde(default)]
    pub attributes: MessageAttributes,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub delivered_to: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct QueueListResponse {
    pub queues: Vec<QueueStatus>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> ApiError {
    error!(error = %e, "{context}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", context)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/uploads", post(create_upload))
        .route("/api/v1/notifications", post(enqueue_notification))
        .route("/api/v1/events", post(publish_event))
        .route("/api/v1/records/:id", get(get_record))
        .route("/api/v1/queues", get(list_queues))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "photo-lifecycle",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = state.pipeline.backends().pool.as_ref() else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ready", "backend": "memory" })),
        );
    };

    match sqlx::query("SELECT 1").fetch_one(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Store an object and announce it on the upload queue
#[instrument(skip(state, request), fields(key = %request.key))]
async fn create_upload(
    State(state): State<AppState>,
    Json(request): Json<UploadRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    if request.key.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "INVALID_KEY", "key must not be empty"));
    }

    let backends = state.pipeline.backends();

    if let Some(encoded) = &request.content_base64 {
        let body = STANDARD.decode(encoded).map_err(|e| {
            api_error(
                StatusCode::BAD_REQUEST,
                "INVALID_CONTENT",
                format!("contentBase64 is not valid base64: {e}"),
            )
        })?;
        let content_type = request
            .content_type
            .as_deref()
            .unwrap_or_else(|| content_type_for_key(&request.key));

        backends
            .objects
            .put_object(&request.key, body, content_type)
            .await
            .map_err(|e| internal_error("Failed to store object", e))?;
    }

    let notification = UploadNotification {
        object_key: request.key.clone(),
    };
    let message_id = backends
        .upload_queue
        .enqueue(OutgoingMessage::new(notification.to_body()))
        .await
        .map_err(|e| internal_error("Failed to enqueue upload notification", e))?;

    info!(message_id = %message_id, "Upload accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message_id,
            key: Some(request.key),
        }),
    ))
}

/// Enqueue an externally produced upload notification as is
async fn enqueue_notification(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let message_id = state
        .pipeline
        .backends()
        .upload_queue
        .enqueue(OutgoingMessage::new(body))
        .await
        .map_err(|e| internal_error("Failed to enqueue notification", e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message_id,
            key: None,
        }),
    ))
}

/// Publish a metadata event or status update onto the topic
async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let body = match request.message {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let message = OutgoingMessage {
        body,
        attributes: request.attributes,
    };

    let receipt = state
        .pipeline
        .backends()
        .topic
        .publish(message)
        .await
        .map_err(|e| internal_error("Failed to publish event", e))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            delivered_to: receipt.delivered_to,
        }),
    ))
}

async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PhotoRecord>, ApiError> {
    let record = state
        .pipeline
        .backends()
        .records
        .get(&id)
        .await
        .map_err(|e| internal_error("Failed to read record", e))?;

    record.map(Json).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("No record with id {id}"),
        )
    })
}

async fn list_queues(
    State(state): State<AppState>,
) -> Result<Json<QueueListResponse>, ApiError> {
    let queues = state
        .pipeline
        .queue_status()
        .await
        .map_err(|e| internal_error("Failed to read queue depths", e))?;

    Ok(Json(QueueListResponse { queues }))
}

/// Start the API server, returning once `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting HTTP ingress");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
