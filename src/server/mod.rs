//! HTTP surface over the [`Ensoul`](crate::service::Ensoul) facade.
//!
//! # Endpoints
//!
//! - `GET  /health` — Liveness check
//! - `/api/v1/auth/*` — Wallet login and logout
//! - `/api/v1/claws/*` — Contributor registration, profile and claim
//! - `/api/v1/souls/*` — Soul creation, lookup, chat and mint confirmation
//! - `/api/v1/fragments/batch` — Batch submission (curated asynchronously)
//! - `/api/v1/admin/*` — Operator actions behind `ENSOUL_ADMIN_TOKEN`

pub mod dto;
pub mod routes;

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::errors::{EnsoulError, QuotaError, ValidationError};

pub use routes::{app_router, AppState};

impl EnsoulError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EnsoulError::Validation(_) => StatusCode::BAD_REQUEST,
            EnsoulError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            EnsoulError::NotClaimed | EnsoulError::Forbidden(_) => StatusCode::FORBIDDEN,
            EnsoulError::NotFound(_) => StatusCode::NOT_FOUND,
            EnsoulError::Conflict(_) => StatusCode::CONFLICT,
            EnsoulError::Quota(QuotaError::Cooldown { .. }) => StatusCode::TOO_MANY_REQUESTS,
            EnsoulError::Quota(QuotaError::MintCeiling { .. }) => StatusCode::CONFLICT,
            EnsoulError::Retired(_) => StatusCode::GONE,
            EnsoulError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EnsoulError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        }));
        let mut response = (status, body).into_response();
        if let EnsoulError::Quota(QuotaError::Cooldown { retry_after_secs }) = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<JsonRejection> for EnsoulError {
    fn from(rejection: JsonRejection) -> Self {
        EnsoulError::Validation(ValidationError::InvalidShape(rejection.body_text()))
    }
}
