use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tandem_shared::{CallError, TokenError};
use tandem_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for ServerError {
    fn from(err: TokenError) -> Self {
        ServerError::Unauthenticated(err.to_string())
    }
}

impl ServerError {
    /// Stable machine-readable reason, shared with the WebSocket `error` event.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Call(e) => e.kind(),
            ServerError::Unauthenticated(_) => "unauthenticated",
            ServerError::BadRequest(_) => "bad_request",
            ServerError::Forbidden(_) => "forbidden",
            ServerError::NotFound(_) => "not_found",
            ServerError::Store(_) | ServerError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Call(e) => match e {
                CallError::InvalidState { .. } | CallError::AlreadyActive => StatusCode::CONFLICT,
                CallError::Unauthorized => StatusCode::FORBIDDEN,
                CallError::ReceiverNotFound | CallError::CallNotFound => StatusCode::NOT_FOUND,
                CallError::SelfCallNotAllowed => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Store(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand to a client.
    pub fn public_message(&self) -> String {
        match self {
            ServerError::Store(_) | ServerError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({
            "error": self.public_message(),
            "kind": self.kind(),
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_shared::CallStatus;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ServerError::from(CallError::InvalidState {
                    current: CallStatus::Ended,
                }),
                StatusCode::CONFLICT,
            ),
            (CallError::AlreadyActive.into(), StatusCode::CONFLICT),
            (CallError::Unauthorized.into(), StatusCode::FORBIDDEN),
            (CallError::ReceiverNotFound.into(), StatusCode::NOT_FOUND),
            (CallError::SelfCallNotAllowed.into(), StatusCode::BAD_REQUEST),
            (
                ServerError::Unauthenticated("no token".into()),
                StatusCode::UNAUTHORIZED,
            ),
            (ServerError::NotFound("user".into()), StatusCode::NOT_FOUND),
            (StoreError::NotFound.into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = ServerError::Internal("disk on fire".into());
        assert_eq!(err.kind(), "internal");
        assert!(!err.public_message().contains("disk"));
    }
}
