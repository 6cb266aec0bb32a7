use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::AccountError;
use crate::announcements::AnnouncementError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Announcement(#[from] AnnouncementError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Not logged in")]
    Unauthenticated,

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Too many requests, please try again later.")]
    RateLimited,

    #[error("OpenAI API key not configured on the server")]
    MissingApiKey,

    #[error("Upstream model error: {0}")]
    Upstream(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Account(err) => match err {
                AccountError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                AccountError::WrongPassword => StatusCode::UNAUTHORIZED,
                AccountError::Banned | AccountError::Suspended => StatusCode::FORBIDDEN,
                AccountError::NotFound(_) => StatusCode::NOT_FOUND,
                AccountError::AlreadyExists(_) | AccountError::LastAdminViolation => {
                    StatusCode::CONFLICT
                }
                AccountError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::Announcement(err) => match err {
                AnnouncementError::InvalidInput => StatusCode::BAD_REQUEST,
                AnnouncementError::NotFound(_) => StatusCode::NOT_FOUND,
                AnnouncementError::Storage(_) | AnnouncementError::Json(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) | AppError::MissingApiKey | AppError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// Convert AppError to an HTTP response
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Storage(_)
            | AppError::Account(AccountError::Storage(_))
            | AppError::Announcement(
                AnnouncementError::Storage(_) | AnnouncementError::Json(_),
            ) => ErrorResponse {
                error: "Storage error".into(),
                details: None,
            },
            AppError::Json(_) => ErrorResponse {
                error: "Internal server error".into(),
                details: None,
            },
            AppError::MissingApiKey => ErrorResponse {
                error: "server".into(),
                details: Some(
                    "OpenAI API key not configured on the server. Copy .env.example to .env and set OPENAI_API_KEY."
                        .into(),
                ),
            },
            AppError::Upstream(details) => ErrorResponse {
                error: "Upstream model error".into(),
                details: Some(details.clone()),
            },
            _ => ErrorResponse {
                error: self.to_string(),
                details: None,
            },
        };

        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::warn!(error = %self, status = status.as_u16(), "request rejected");
        }

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

pub type Result<T> = std::result::Result<T, AppError>;
