//! Notification HTTP API.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use beacon_core::{NewNotification, Notification};
use beacon_store::{ListQuery, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::server::AppState;

/// JSON error response: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// 400 with a code.
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }

    /// 404.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    /// 503.
    pub fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code,
            message: message.into(),
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: "internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": {"code": self.code, "message": self.message}});
        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidNotification(message) => Self::bad_request("INVALID_NOTIFICATION", message),
            other => {
                error!(error = %other, "store error");
                Self::internal()
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("INVALID_BODY", rejection.body_text())
    }
}

/// `POST /notifications`: create, then best-effort push.
pub async fn create_notification(
    State(state): State<AppState>,
    body: Result<Json<NewNotification>, JsonRejection>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    let Json(new) = body?;
    let mut created = state.store.create(new).await?;

    let delivered = state.pusher.push(&created).await;
    match state.store.mark_sent(&created.id).await {
        Ok(_) => created.sent = true,
        Err(err) => warn!(notification_id = %created.id, error = %err, "failed to record push attempt"),
    }
    debug!(notification_id = %created.id, user_id = %created.user_id, delivered, "notification created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /notifications` parameters.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    /// Owner; required.
    pub user_id: Option<String>,
    /// Only unread rows.
    #[serde(default)]
    pub unread_only: bool,
    /// Page size (default 50, max 200).
    pub limit: Option<u32>,
}

/// `GET /notifications` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    /// Newest first.
    pub notifications: Vec<Notification>,
    /// All unread rows for the user, regardless of the page.
    pub unread_count: u64,
}

/// `GET /notifications?userId=&unreadOnly=&limit=`.
pub async fn list_notifications(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let user_id = params
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("INVALID_USER_ID", "userId is required"))?;
    let query = ListQuery {
        unread_only: params.unread_only,
        limit: params.limit.unwrap_or(ListQuery::default().limit),
    };
    let notifications = state.store.list_for_user(&user_id, query).await?;
    let unread_count = state.store.unread_count(&user_id).await?;
    Ok(Json(ListResponse {
        notifications,
        unread_count,
    }))
}

/// `POST /notifications/{id}/read` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    /// Must own the notification.
    pub user_id: String,
}

/// `POST /notifications/{id}/read`.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<MarkReadBody>, JsonRejection>,
) -> Result<Json<Notification>, ApiError> {
    let Json(body) = body?;
    state
        .store
        .mark_read(&id, &body.user_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("notification {id} not found")))
}
