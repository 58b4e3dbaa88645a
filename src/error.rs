use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::ledger::LedgerError;
use crate::schema_registry::SchemaError;
use crate::store::StoreError;

/// Core error kind, surfaced to the Task API boundary per §7. Every other
/// layer returns its own typed error and never touches `axum`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn from_store(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(_) => Self::NotFound,
            StoreError::Conflict(message) => Self::Conflict(message),
            StoreError::Db(message) => Self::Internal(message),
        }
    }

    pub fn from_ledger(error: LedgerError) -> Self {
        match error {
            LedgerError::InsufficientFunds => Self::InsufficientFunds,
            LedgerError::Store(inner) => Self::from_store(inner),
        }
    }

    pub fn from_schema(error: SchemaError) -> Self {
        match error {
            SchemaError::UnknownCapability(name) => {
                Self::BadRequest(format!("unknown capability: {name}"))
            }
            SchemaError::InputRejected(detail) => Self::ValidationFailed(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::InsufficientFunds => StatusCode::PAYMENT_REQUIRED,
            Self::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
