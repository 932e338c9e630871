//! REST client for the call control surface.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tandem_shared::{CallError, CallId, CallRecord, MediaKind, User, UserId};
use tracing::debug;

use crate::agent::CallControl;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.api_base().to_string(),
            token: config.token.clone(),
        }
    }

    pub async fn initiate(&self, receiver: UserId, media_kind: MediaKind) -> Result<CallRecord> {
        let body = serde_json::json!({
            "receiver_id": receiver,
            "media_kind": media_kind,
        });
        self.request(Method::POST, "/api/calls/initiate", Some(body)).await
    }

    pub async fn answer(&self, call_id: CallId) -> Result<CallRecord> {
        self.request(Method::POST, &format!("/api/calls/{call_id}/answer"), None)
            .await
    }

    pub async fn reject(&self, call_id: CallId) -> Result<()> {
        let _: serde_json::Value = self
            .request(Method::POST, &format!("/api/calls/{call_id}/reject"), None)
            .await?;
        Ok(())
    }

    pub async fn end(&self, call_id: CallId) -> Result<CallRecord> {
        self.request(Method::POST, &format!("/api/calls/{call_id}/end"), None)
            .await
    }

    pub async fn active(&self) -> Result<Option<CallRecord>> {
        self.request(Method::GET, "/api/calls/active", None).await
    }

    pub async fn history(&self) -> Result<Vec<CallRecord>> {
        self.request(Method::GET, "/api/calls/history", None).await
    }

    pub async fn get(&self, call_id: CallId) -> Result<CallRecord> {
        self.request(Method::GET, &format!("/api/calls/{call_id}"), None)
            .await
    }

    /// Directory entry for a peer, e.g. to label an incoming call.
    pub async fn user(&self, id: UserId) -> Result<User> {
        self.request(Method::GET, &format!("/api/users/{id}"), None)
            .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let mut req = self
            .http
            .request(method.clone(), format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req.send().await?;
        let status = response.status();
        debug!(%method, path, status = status.as_u16(), "api request");

        if status.is_success() {
            return Ok(response.json().await?);
        }
        let text = response.text().await.unwrap_or_default();
        Err(error_from_response(status, &text))
    }
}

/// Map an error response back onto the call taxonomy where possible.
fn error_from_response(status: StatusCode, body: &str) -> ClientError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody { error, kind }) => match CallError::from_kind(&kind, &error) {
            Some(call_error) => ClientError::Call(call_error),
            None => ClientError::Server {
                status: status.as_u16(),
                message: error,
            },
        },
        Err(_) => ClientError::Server {
            status: status.as_u16(),
            message: body.to_string(),
        },
    }
}

#[async_trait]
impl CallControl for ApiClient {
    async fn initiate(&self, receiver: UserId, media_kind: MediaKind) -> Result<CallRecord> {
        ApiClient::initiate(self, receiver, media_kind).await
    }

    async fn answer(&self, call_id: CallId) -> Result<CallRecord> {
        ApiClient::answer(self, call_id).await
    }

    async fn reject(&self, call_id: CallId) -> Result<()> {
        ApiClient::reject(self, call_id).await
    }

    async fn end(&self, call_id: CallId) -> Result<CallRecord> {
        ApiClient::end(self, call_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_shared::CallStatus;

    #[test]
    fn test_call_errors_come_back_typed() {
        let body = r#"{"error":"Call is rejected, operation not allowed in this state","kind":"invalid_state"}"#;
        let err = error_from_response(StatusCode::CONFLICT, body);
        assert_eq!(
            err.call_error(),
            Some(&CallError::InvalidState {
                current: CallStatus::Rejected
            })
        );

        let body = r#"{"error":"A call between these users is already in progress","kind":"already_active"}"#;
        assert_eq!(
            error_from_response(StatusCode::CONFLICT, body).call_error(),
            Some(&CallError::AlreadyActive)
        );
    }

    #[test]
    fn test_other_errors_keep_status() {
        let body = r#"{"error":"Unauthenticated: Token expired","kind":"unauthenticated"}"#;
        match error_from_response(StatusCode::UNAUTHORIZED, body) {
            ClientError::Server { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("expired"));
            }
            other => panic!("unexpected {other:?}"),
        }

        match error_from_response(StatusCode::TOO_MANY_REQUESTS, "") {
            ClientError::Server { status, .. } => assert_eq!(status, 429),
            other => panic!("unexpected {other:?}"),
        }
    }
}
