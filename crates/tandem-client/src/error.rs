use tandem_shared::{CallError, TokenError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid session token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("Another call is already in progress")]
    Busy,

    #[error("No call to {0}")]
    NoCall(&'static str),

    #[error("Call agent stopped")]
    AgentStopped,
}

impl ClientError {
    /// The call-level reason, if the server refused the operation for one.
    pub fn call_error(&self) -> Option<&CallError> {
        match self {
            ClientError::Call(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
