//! Structured, HTTP-facing error taxonomy.
//!
//! Internal glue code uses `anyhow::Result`; anything that crosses the
//! HTTP boundary is converted into an `AppError` variant so the response
//! envelope (code, safe message, optional details) never leaks internals.

use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {message}")]
    Validation { message: String, field: Option<String> },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("all {provider_count} provider(s) unavailable")]
    AllProvidersUnavailable { provider_count: usize, last_errors: HashMap<String, String> },

    #[error("kv store unavailable: {0}")]
    KvUnavailable(String),

    #[error("upstream provider error: {0}")]
    ProviderError(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    request_id: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Validation { .. } => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Conflict(_) => "conflict",
            AppError::UnsupportedAction(_) => "unsupported_action",
            AppError::AllProvidersUnavailable { .. } => "all_providers_unavailable",
            AppError::KvUnavailable(_) => "kv_unavailable",
            AppError::ProviderError(_) => "provider_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::UnsupportedAction(_) => StatusCode::BAD_REQUEST,
            AppError::AllProvidersUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::KvUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ProviderError(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let status = self.status();

        // Never leak internal error text for server-side failures.
        let (message, details) = match &self {
            AppError::Internal(e) => (
                "an internal error occurred".to_string(),
                Some(e.to_string()[..e.to_string().len().min(300)].to_string()),
            ),
            AppError::ProviderError(msg) => (
                "the upstream language model provider returned an error".to_string(),
                Some(msg[..msg.len().min(300)].to_string()),
            ),
            AppError::AllProvidersUnavailable { last_errors, .. } => (
                self.to_string(),
                (!last_errors.is_empty()).then(|| {
                    let joined = last_errors
                        .iter()
                        .map(|(id, err)| format!("{id}: {err}"))
                        .collect::<Vec<_>>()
                        .join("; ");
                    joined[..joined.len().min(300)].to_string()
                }),
            ),
            other => (other.to_string(), None),
        };

        let field = match &self {
            AppError::Validation { field, .. } => field.clone(),
            _ => None,
        };

        let mut response = (
            status,
            Json(ErrorEnvelope {
                error: ErrorBody {
                    code: self.code(),
                    message,
                    field,
                    details,
                    request_id,
                    timestamp: chrono::Utc::now(),
                },
            }),
        )
            .into_response();

        if let AppError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
