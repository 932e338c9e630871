//! Per-call media negotiation driver.
//!
//! A [`MediaCoordinator`] owns the negotiation session, the engine and the
//! captured media of exactly one call. It is driven by discrete events from
//! its owner and reports back through [`CoordinatorEvent`] values.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_shared::{CallError, CallId, MediaKind, Signal, UserId};
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, LocalMedia, MediaDevices, MediaError, NegotiationEngine, TrackKind};
use crate::negotiation::{NegotiationAction, NegotiationRole, NegotiationSession};

/// Outbound path for negotiation payloads. The target is implied by the call.
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_signal(&self, call_id: CallId, signal: Signal) -> Result<(), MediaError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    MediaConnected,
    RemoteMedia(TrackKind),
    Failed(CallError),
}

pub struct MediaCoordinator {
    session: NegotiationSession,
    engine: Box<dyn NegotiationEngine>,
    media: Option<LocalMedia>,
    sink: Arc<dyn SignalSink>,
    engine_closed: bool,
}

impl MediaCoordinator {
    pub fn new(
        session: NegotiationSession,
        engine: Box<dyn NegotiationEngine>,
        sink: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            session,
            engine,
            media: None,
            sink,
            engine_closed: false,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.session.call_id
    }

    pub fn session(&self) -> &NegotiationSession {
        &self.session
    }

    pub fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    /// Acquire local media and attach it to the engine.
    ///
    /// For the answering side this also applies an offer that arrived early.
    pub async fn start(
        &mut self,
        devices: &dyn MediaDevices,
        kind: MediaKind,
    ) -> Result<Option<CoordinatorEvent>, CallError> {
        if self.session.is_closed() {
            return Ok(None);
        }

        let media = devices
            .acquire(kind)
            .await
            .map_err(|e| CallError::MediaUnavailable(e.to_string()))?;

        self.engine
            .attach(&media)
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        self.media = Some(media);

        debug!(call = %self.call_id(), kind = kind.as_str(), "local media attached");

        match self.session.media_ready() {
            NegotiationAction::AnswerOffer(offer) => Ok(self.answer(offer).await),
            _ => Ok(None),
        }
    }

    /// Create and send the offer. Only meaningful for the calling side, once
    /// the call is answered.
    pub async fn send_offer(&mut self) -> Result<(), CallError> {
        if self.session.begin_offer() != NegotiationAction::SendOffer {
            debug!(call = %self.call_id(), "offer not due");
            return Ok(());
        }

        let sdp = self
            .engine
            .create_offer()
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        self.session.local_description_applied();

        info!(call = %self.call_id(), "sending offer");
        self.relay(Signal::Offer(sdp)).await;
        Ok(())
    }

    pub async fn handle_signal(&mut self, signal: Signal) -> Option<CoordinatorEvent> {
        match self.session.on_remote_signal(signal) {
            NegotiationAction::AnswerOffer(offer) => self.answer(offer).await,
            NegotiationAction::ApplyAnswer(answer) => {
                if let Err(e) = self.engine.accept_answer(answer).await {
                    return Some(self.fail(e));
                }
                self.flush_candidates().await;
                None
            }
            NegotiationAction::ApplyCandidate(candidate) => {
                self.apply_candidate(candidate).await;
                None
            }
            NegotiationAction::Queued => {
                debug!(call = %self.call_id(), "signal queued");
                None
            }
            NegotiationAction::SendOffer | NegotiationAction::Ignored => None,
        }
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) -> Option<CoordinatorEvent> {
        if self.session.is_closed() {
            return None;
        }
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.relay(Signal::Candidate(candidate)).await;
                None
            }
            EngineEvent::Connected => {
                if self.session.mark_connected() {
                    info!(call = %self.call_id(), "media connected");
                    Some(CoordinatorEvent::MediaConnected)
                } else {
                    None
                }
            }
            EngineEvent::RemoteTrack(kind) => Some(CoordinatorEvent::RemoteMedia(kind)),
            EngineEvent::Failed(reason) => {
                warn!(call = %self.call_id(), %reason, "negotiation failed");
                Some(CoordinatorEvent::Failed(CallError::NegotiationFailed(reason)))
            }
        }
    }

    /// Tear down the engine and release local media. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.session.close();
        if !self.engine_closed {
            self.engine_closed = true;
            self.engine.close().await;
        }
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
    }

    async fn answer(&mut self, offer: String) -> Option<CoordinatorEvent> {
        let answer = match self.engine.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => return Some(self.fail(e)),
        };
        self.session.local_description_applied();

        info!(call = %self.call_id(), "sending answer");
        self.relay(Signal::Answer(answer)).await;
        self.flush_candidates().await;
        None
    }

    async fn flush_candidates(&mut self) {
        for candidate in self.session.remote_description_applied() {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: String) {
        // One unusable candidate does not sink the negotiation.
        if let Err(e) = self.engine.add_remote_candidate(candidate).await {
            warn!(call = %self.call_id(), error = %e, "dropping remote candidate");
        }
    }

    async fn relay(&self, signal: Signal) {
        let kind = signal.label();
        if let Err(e) = self.sink.send_signal(self.call_id(), signal).await {
            warn!(call = %self.call_id(), kind, error = %e, "failed to send signal");
        }
    }

    fn fail(&self, err: MediaError) -> CoordinatorEvent {
        warn!(call = %self.call_id(), error = %err, "negotiation failed");
        CoordinatorEvent::Failed(CallError::NegotiationFailed(err.to_string()))
    }
}

/// Build a coordinator for the given side of a call.
pub fn coordinator_for(
    call_id: CallId,
    local: UserId,
    remote: UserId,
    role: NegotiationRole,
    engine: Box<dyn NegotiationEngine>,
    sink: Arc<dyn SignalSink>,
) -> MediaCoordinator {
    MediaCoordinator::new(NegotiationSession::new(call_id, local, remote, role), engine, sink)
}
