use std::collections::VecDeque;

use tandem_shared::{CallId, Signal, UserId};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

/// The caller offers, the receiver answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

/// What the owner of a [`NegotiationSession`] must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAction {
    SendOffer,
    AnswerOffer(String),
    ApplyAnswer(String),
    ApplyCandidate(String),
    Queued,
    Ignored,
}

/// Offer/answer state for one call, independent of any media engine.
///
/// Remote candidates arriving before the remote description are queued and
/// handed back by [`NegotiationSession::remote_description_applied`]. An
/// offer arriving before local media is ready is stashed and handed back by
/// [`NegotiationSession::media_ready`].
#[derive(Debug)]
pub struct NegotiationSession {
    pub call_id: CallId,
    pub local_user: UserId,
    pub remote_user: UserId,
    pub role: NegotiationRole,
    phase: NegotiationPhase,
    media_ready: bool,
    local_description: bool,
    remote_description: bool,
    pending_offer: Option<String>,
    pending_candidates: VecDeque<String>,
}

impl NegotiationSession {
    pub fn new(
        call_id: CallId,
        local_user: UserId,
        remote_user: UserId,
        role: NegotiationRole,
    ) -> Self {
        Self {
            call_id,
            local_user,
            remote_user,
            role,
            phase: NegotiationPhase::Idle,
            media_ready: false,
            local_description: false,
            remote_description: false,
            pending_offer: None,
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == NegotiationPhase::Closed
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Local media is attached. Returns the stashed early offer, if any.
    pub fn media_ready(&mut self) -> NegotiationAction {
        if self.is_closed() {
            return NegotiationAction::Ignored;
        }
        self.media_ready = true;
        match self.pending_offer.take() {
            Some(offer) => {
                debug!(call = %self.call_id, "applying stashed offer");
                self.phase = NegotiationPhase::Negotiating;
                NegotiationAction::AnswerOffer(offer)
            }
            None => NegotiationAction::Ignored,
        }
    }

    /// Start the offer. Only the offerer offers, once, with media ready.
    pub fn begin_offer(&mut self) -> NegotiationAction {
        if self.role != NegotiationRole::Offerer
            || self.phase != NegotiationPhase::Idle
            || !self.media_ready
        {
            return NegotiationAction::Ignored;
        }
        self.phase = NegotiationPhase::Negotiating;
        NegotiationAction::SendOffer
    }

    pub fn local_description_applied(&mut self) {
        self.local_description = true;
    }

    /// The remote description is in place; drain the queued candidates.
    pub fn remote_description_applied(&mut self) -> Vec<String> {
        self.remote_description = true;
        self.pending_candidates.drain(..).collect()
    }

    pub fn on_remote_signal(&mut self, signal: Signal) -> NegotiationAction {
        if self.is_closed() {
            debug!(call = %self.call_id, kind = signal.label(), "signal after close");
            return NegotiationAction::Ignored;
        }

        match signal {
            Signal::Offer(sdp) => {
                if self.role != NegotiationRole::Answerer
                    || self.remote_description
                    || self.pending_offer.is_some()
                    || self.phase != NegotiationPhase::Idle
                {
                    debug!(call = %self.call_id, "duplicate or unexpected offer");
                    return NegotiationAction::Ignored;
                }
                if !self.media_ready {
                    self.pending_offer = Some(sdp);
                    return NegotiationAction::Queued;
                }
                self.phase = NegotiationPhase::Negotiating;
                NegotiationAction::AnswerOffer(sdp)
            }
            Signal::Answer(sdp) => {
                if self.role != NegotiationRole::Offerer
                    || !self.local_description
                    || self.remote_description
                {
                    debug!(call = %self.call_id, "duplicate or unexpected answer");
                    return NegotiationAction::Ignored;
                }
                NegotiationAction::ApplyAnswer(sdp)
            }
            Signal::Candidate(candidate) => {
                if self.remote_description {
                    NegotiationAction::ApplyCandidate(candidate)
                } else {
                    self.pending_candidates.push_back(candidate);
                    NegotiationAction::Queued
                }
            }
        }
    }

    pub fn mark_connected(&mut self) -> bool {
        if matches!(self.phase, NegotiationPhase::Closed | NegotiationPhase::Connected) {
            return false;
        }
        self.phase = NegotiationPhase::Connected;
        true
    }

    /// Returns `false` if the session was already closed.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.phase = NegotiationPhase::Closed;
        self.pending_offer = None;
        self.pending_candidates.clear();
        true
    }
}
