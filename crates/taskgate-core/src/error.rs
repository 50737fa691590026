use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use taskgate_provider_core::{TaskError, TransportError};

use crate::response::failure;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate {0}")]
    Conflict(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("channel {0} not found")]
    ChannelNotFound(i64),
    #[error("model {0} is not supported by this channel")]
    UnsupportedModel(String),
    #[error("user {0} not found")]
    AccountNotFound(i64),
    #[error("user {0} is disabled")]
    AccountDisabled(i64),
    #[error("insufficient quota: need {needed}, have {available}")]
    InsufficientQuota { needed: i64, available: i64 },
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("task_id is required")]
    InvalidTaskId,
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::ChannelNotFound(_) | RelayError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::UnsupportedModel(_) | RelayError::InvalidTaskId => StatusCode::BAD_REQUEST,
            RelayError::AccountNotFound(_)
            | RelayError::AccountDisabled(_)
            | RelayError::InsufficientQuota { .. }
            | RelayError::Token(_) => StatusCode::FORBIDDEN,
            RelayError::Task(err) => err.status,
            RelayError::Transport(err) => err.status(),
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            RelayError::ChannelNotFound(_) => "channel_not_found",
            RelayError::UnsupportedModel(_) => "model_not_supported",
            RelayError::AccountNotFound(_) => "user_not_found",
            RelayError::AccountDisabled(_) => "user_disabled",
            RelayError::InsufficientQuota { .. } => "insufficient_quota",
            RelayError::Token(_) => "token_rejected",
            RelayError::InvalidTaskId => "invalid_task_id",
            RelayError::TaskNotFound(_) => "task_not_found",
            RelayError::Task(err) => &err.code,
            RelayError::Transport(TransportError::Timeout(_)) => "upstream_timeout",
            RelayError::Transport(_) => "upstream_error",
            RelayError::Store(_) => "store_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            RelayError::Task(err) => err.message.clone(),
            RelayError::Store(err) => {
                error!(event = "store_error", error = %err);
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };
        (
            status,
            Json(json!({ "code": self.code(), "message": message })),
        )
            .into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid user id")]
    InvalidUserId,
    #[error("quota_rmb must be at least 0.01 and within the single top-up limit")]
    InvalidAmount,
    #[error("user not found")]
    AccountNotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        match self {
            LedgerError::Store(err) => {
                error!(event = "store_error", op = "ledger", error = %err);
                failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to update user quota")
            }
            other => failure(StatusCode::BAD_REQUEST, other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid user id")]
    InvalidUserId,
    #[error("user not found")]
    UserNotFound,
    #[error("token name too long")]
    NameTooLong,
    #[error("token key is required")]
    MissingKey,
    #[error("invalid token")]
    InvalidToken,
    #[error(
        "token has expired and cannot be enabled; extend the expiry time or set it to never expire"
    )]
    CannotEnableExpired,
    #[error(
        "token quota is exhausted and cannot be enabled; raise the remaining quota or make it unlimited"
    )]
    CannotEnableExhausted,
    #[error("token is disabled")]
    Disabled,
    #[error("token has expired")]
    Expired,
    #[error("token quota is exhausted")]
    Exhausted,
    #[error("token does not belong to this user")]
    WrongOwner,
    #[error("token may not use model {0}")]
    ModelNotAllowed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for TokenError {
    fn into_response(self) -> Response {
        match self {
            TokenError::UserNotFound => failure(StatusCode::NOT_FOUND, self.to_string()),
            TokenError::NameTooLong
            | TokenError::CannotEnableExpired
            | TokenError::CannotEnableExhausted => failure(StatusCode::OK, self.to_string()),
            TokenError::Store(err) => {
                error!(event = "store_error", op = "token", error = %err);
                failure(StatusCode::INTERNAL_SERVER_ERROR, "failed to save token")
            }
            other => failure(StatusCode::BAD_REQUEST, other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("invalid request parameters: {0}")]
    InvalidInput(String),
    #[error("user already exists")]
    AlreadyExists,
    #[error("failed to hash password: {0}")]
    PasswordHash(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for AccountError {
    fn into_response(self) -> Response {
        match self {
            AccountError::InvalidInput(_) | AccountError::AlreadyExists => {
                failure(StatusCode::BAD_REQUEST, self.to_string())
            }
            AccountError::PasswordHash(_) | AccountError::Store(_) => {
                error!(event = "store_error", op = "account", error = %self);
                failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to create user: {self}"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn relay_errors_keep_task_status_and_code() {
        let err = RelayError::from(TaskError::bad_request(
            "missing_required_field",
            "prompt or image is required",
        ));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "missing_required_field");

        let err = RelayError::from(TransportError::Timeout(Duration::from_secs(30)));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), "upstream_timeout");
    }

    #[test]
    fn business_rejections_on_tokens_are_200() {
        let response = TokenError::NameTooLong.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let response = TokenError::UserNotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = TokenError::InvalidToken.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
