use crate::core::services::SettingsError;
use crate::core::session::SessionError;
use crate::infrastructure::traits::StoreError;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::error;
use serde_json::json;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

pub mod chat;
pub mod conversations;
pub mod models;
pub mod settings;

const X_USER_ID: &str = "X-User-ID";

/// Opaque per-browser identity. The client generates the key once and sends it
/// with every request; there is no authentication behind it.
#[derive(Debug)]
pub struct ExtractUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for ExtractUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        let Some(user_id) = parts.headers.get(X_USER_ID) else {
            return Err(ApiError::BadRequest("`X-User-ID` header is missing".into()));
        };

        user_id
            .to_str()
            .ok()
            .and_then(|user_id| Uuid::from_str(user_id.trim()).ok())
            .map(ExtractUser)
            .ok_or_else(|| ApiError::BadRequest("invalid user id".into()))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Busy(#[from] SessionError),

    #[error("{0}")]
    Upstream(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SettingsError> for ApiError {
    fn from(error: SettingsError) -> Self {
        match error {
            SettingsError::Store(e) => ApiError::Store(e),
            e @ (SettingsError::OutOfRange { .. } | SettingsError::ServerNotAllowed(_)) => {
                ApiError::Unprocessable(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Busy(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(e) => {
                error!("store failure: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let detail = match &self {
            ApiError::Store(_) => "internal error".to_owned(),
            other => other.to_string(),
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// All routes, without DI or middleware; callers attach the provider.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .nest(
            "/api/v1",
            Router::new()
                .nest("/conversations", conversations::router())
                .nest("/chat", chat::router())
                .nest("/settings", settings::router())
                .nest("/models", models::router()),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
