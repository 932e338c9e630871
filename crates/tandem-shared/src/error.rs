use thiserror::Error;

use crate::types::{CallStatus, UserId};

/// Failure kinds of the call state machine and its negotiation layer.
///
/// Every variant maps to a stable `kind()` string so that clients can
/// react to the reason without parsing messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Call is {current}, operation not allowed in this state")]
    InvalidState { current: CallStatus },

    #[error("Not authorized for this call")]
    Unauthorized,

    #[error("Receiver not found")]
    ReceiverNotFound,

    #[error("Cannot call yourself")]
    SelfCallNotAllowed,

    #[error("A call between these users is already in progress")]
    AlreadyActive,

    #[error("Call not found")]
    CallNotFound,

    #[error("Local media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("Media negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("User {0} is not connected")]
    RelayUndeliverable(UserId),
}

impl CallError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => "invalid_state",
            Self::Unauthorized => "unauthorized",
            Self::ReceiverNotFound => "receiver_not_found",
            Self::SelfCallNotAllowed => "self_call_not_allowed",
            Self::AlreadyActive => "already_active",
            Self::CallNotFound => "call_not_found",
            Self::MediaUnavailable(_) => "media_unavailable",
            Self::NegotiationFailed(_) => "negotiation_failed",
            Self::RelayUndeliverable(_) => "relay_undeliverable",
        }
    }

    /// Rebuild an error from its wire `kind` and message.
    ///
    /// `InvalidState` loses its concrete status on the wire; callers are
    /// expected to refresh the call anyway.
    pub fn from_kind(kind: &str, message: &str) -> Option<Self> {
        let err = match kind {
            "invalid_state" => Self::InvalidState {
                current: parse_status_from_message(message).unwrap_or(CallStatus::Ended),
            },
            "unauthorized" => Self::Unauthorized,
            "receiver_not_found" => Self::ReceiverNotFound,
            "self_call_not_allowed" => Self::SelfCallNotAllowed,
            "already_active" => Self::AlreadyActive,
            "call_not_found" => Self::CallNotFound,
            "media_unavailable" => Self::MediaUnavailable(message.to_string()),
            "negotiation_failed" => Self::NegotiationFailed(message.to_string()),
            _ => return None,
        };
        Some(err)
    }
}

fn parse_status_from_message(message: &str) -> Option<CallStatus> {
    message
        .strip_prefix("Call is ")?
        .split(',')
        .next()
        .and_then(CallStatus::parse)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Invalid issuer key")]
    InvalidIssuerKey,
}
