//! HTTP error responses for the control API.
//!
//! Every failure leaves a handler as an [`ApiError`] and is rendered as
//! `{"code": ..., "message": ...}` with a status matching the code.
//! Store details are logged server-side and never echoed to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::announcer::AnnounceError;
use crate::store::{IdentityError, StoreError};

/// Error returned by control API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authenticated")]
    Unauthorized,

    #[error("user not found")]
    UserNotFound,

    #[error("admin role required")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("notification store unavailable")]
    Unavailable,

    #[error("internal error")]
    Internal,
}

/// JSON body of an error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::UserNotFound => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "not_authenticated",
            Self::UserNotFound => "user_not_found",
            Self::Forbidden => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation_error",
            Self::Unavailable => "db_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::NotAuthenticated => Self::Unauthorized,
            IdentityError::UserNotFound => Self::UserNotFound,
            IdentityError::Unavailable(reason) => {
                tracing::warn!(reason = %reason, "Identity lookup unavailable");
                Self::Unavailable
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "Notification store error");
        Self::Unavailable
    }
}

impl From<AnnounceError> for ApiError {
    fn from(e: AnnounceError) -> Self {
        match e {
            AnnounceError::Store(e) => e.into(),
            AnnounceError::Task(e) => e.into(),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        tracing::error!(error = %e, "Blocking store task failed");
        Self::Internal
    }
}
