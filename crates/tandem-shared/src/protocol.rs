use serde::{Deserialize, Serialize};

use crate::call::CallRecord;
use crate::types::{CallId, UserId};

/// Frames a client sends over its signaling socket.
///
/// No frame names its sender or its target: the server derives the sender
/// from the authenticated connection and the target from the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    NegotiationOffer { call_id: CallId, sdp: String },
    NegotiationAnswer { call_id: CallId, sdp: String },
    NegotiationCandidate { call_id: CallId, candidate: String },
    Ping,
}

impl ClientFrame {
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::NegotiationOffer { call_id, .. }
            | Self::NegotiationAnswer { call_id, .. }
            | Self::NegotiationCandidate { call_id, .. } => Some(*call_id),
            Self::Ping => None,
        }
    }

    /// Split a negotiation frame into its call and opaque payload.
    pub fn into_signal(self) -> Option<(CallId, Signal)> {
        match self {
            Self::NegotiationOffer { call_id, sdp } => Some((call_id, Signal::Offer(sdp))),
            Self::NegotiationAnswer { call_id, sdp } => Some((call_id, Signal::Answer(sdp))),
            Self::NegotiationCandidate { call_id, candidate } => {
                Some((call_id, Signal::Candidate(candidate)))
            }
            Self::Ping => None,
        }
    }

    pub fn from_signal(call_id: CallId, signal: Signal) -> Self {
        match signal {
            Signal::Offer(sdp) => Self::NegotiationOffer { call_id, sdp },
            Signal::Answer(sdp) => Self::NegotiationAnswer { call_id, sdp },
            Signal::Candidate(candidate) => Self::NegotiationCandidate { call_id, candidate },
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Opaque media negotiation payload. Relayed, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    Offer(String),
    Answer(String),
    Candidate(String),
}

impl Signal {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
        }
    }
}

/// Events the server pushes to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    IncomingCall { call: CallRecord },
    CallAnswered { call: CallRecord },
    CallRejected { call: CallRecord },
    CallEnded { call: CallRecord, ended_by: UserId },
    CallMissed { call: CallRecord },
    NegotiationOffer { call_id: CallId, from: UserId, sdp: String },
    NegotiationAnswer { call_id: CallId, from: UserId, sdp: String },
    NegotiationCandidate { call_id: CallId, from: UserId, candidate: String },
    Pong,
    Error { kind: String, message: String },
}

impl ServerEvent {
    /// Stamp a relayed negotiation payload with its authenticated sender.
    pub fn relayed(call_id: CallId, from: UserId, signal: Signal) -> Self {
        match signal {
            Signal::Offer(sdp) => Self::NegotiationOffer { call_id, from, sdp },
            Signal::Answer(sdp) => Self::NegotiationAnswer { call_id, from, sdp },
            Signal::Candidate(candidate) => Self::NegotiationCandidate {
                call_id,
                from,
                candidate,
            },
        }
    }

    /// The relayed negotiation payload, if this is one.
    pub fn as_signal(&self) -> Option<(CallId, UserId, Signal)> {
        match self {
            Self::NegotiationOffer { call_id, from, sdp } => {
                Some((*call_id, *from, Signal::Offer(sdp.clone())))
            }
            Self::NegotiationAnswer { call_id, from, sdp } => {
                Some((*call_id, *from, Signal::Answer(sdp.clone())))
            }
            Self::NegotiationCandidate {
                call_id,
                from,
                candidate,
            } => Some((*call_id, *from, Signal::Candidate(candidate.clone()))),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallAnswered { .. } => "call-answered",
            Self::CallRejected { .. } => "call-rejected",
            Self::CallEnded { .. } => "call-ended",
            Self::CallMissed { .. } => "call-missed",
            Self::NegotiationOffer { .. } => "negotiation-offer",
            Self::NegotiationAnswer { .. } => "negotiation-answer",
            Self::NegotiationCandidate { .. } => "negotiation-candidate",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
