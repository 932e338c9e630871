//! WebRTC-backed [`NegotiationEngine`].
//!
//! Each local track becomes an Opus or VP8 sample track on a fresh peer
//! connection. Candidates travel as JSON-encoded `RTCIceCandidateInit`.

use std::sync::Arc;

use async_trait::async_trait;
use tandem_shared::constants::DEFAULT_STUN_SERVERS;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::engine::{
    EngineEvent, EngineEventSink, EngineFactory, LocalMedia, MediaError, NegotiationEngine,
    TrackKind,
};

const STREAM_ID: &str = "tandem";

fn rtc_err(e: webrtc::Error) -> MediaError {
    MediaError::WebRtc(e.to_string())
}

pub fn default_ice_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

pub struct RtcEngine {
    ice_servers: Vec<String>,
    events: EngineEventSink,
    pc: Option<Arc<RTCPeerConnection>>,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl RtcEngine {
    pub fn new(ice_servers: Vec<String>, events: EngineEventSink) -> Self {
        Self {
            ice_servers,
            events,
            pc: None,
            tracks: Vec::new(),
        }
    }

    /// Sample tracks created for the attached media. Nothing in this crate
    /// writes to them; the application encodes captured frames and calls
    /// `write_sample`, honouring [`crate::LocalTrack::is_enabled`].
    pub fn local_tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }

    fn pc(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        self.pc.clone().ok_or(MediaError::NotAttached)
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rtc_err)?);
        self.install_handlers(&pc);
        Ok(pc)
    }

    fn install_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => {
                        events.emit(EngineEvent::LocalCandidate(json));
                    }
                    _ => debug!("skipping unserializable local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!(call = %events.call_id(), ?state, "peer connection state");
            match state {
                RTCPeerConnectionState::Connected => {
                    events.emit(EngineEvent::Connected);
                }
                RTCPeerConnectionState::Failed => {
                    events.emit(EngineEvent::Failed("peer connection failed".into()));
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            events.emit(EngineEvent::RemoteTrack(kind));
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn attach(&mut self, media: &LocalMedia) -> Result<(), MediaError> {
        let pc = self.create_peer_connection().await?;

        for local in media.tracks() {
            let mime_type = match local.kind {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                local.id.clone(),
                STREAM_ID.to_owned(),
            ));
            pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_err)?;
            self.tracks.push(track);
        }

        self.pc = Some(pc);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<String, MediaError> {
        let pc = self.pc()?;
        let offer = pc.create_offer(None).await.map_err(rtc_err)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&mut self, offer: String) -> Result<String, MediaError> {
        let pc = self.pc()?;
        let offer =
            RTCSessionDescription::offer(offer).map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer).await.map_err(rtc_err)?;

        let answer = pc.create_answer(None).await.map_err(rtc_err)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(rtc_err)?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&mut self, answer: String) -> Result<(), MediaError> {
        let pc = self.pc()?;
        let answer = RTCSessionDescription::answer(answer)
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(answer).await.map_err(rtc_err)
    }

    async fn add_remote_candidate(&mut self, candidate: String) -> Result<(), MediaError> {
        let pc = self.pc()?;
        let init: RTCIceCandidateInit = serde_json::from_str(&candidate)
            .map_err(|e| MediaError::InvalidCandidate(e.to_string()))?;
        pc.add_ice_candidate(init).await.map_err(rtc_err)
    }

    async fn close(&mut self) {
        self.tracks.clear();
        if let Some(pc) = self.pc.take() {
            if let Err(e) = pc.close().await {
                debug!(error = %e, "peer connection close failed");
            }
        }
    }
}

/// Builds an [`RtcEngine`] per call.
#[derive(Debug, Clone)]
pub struct RtcEngineFactory {
    pub ice_servers: Vec<String>,
}

impl RtcEngineFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Default for RtcEngineFactory {
    fn default() -> Self {
        Self::new(default_ice_servers())
    }
}

impl EngineFactory for RtcEngineFactory {
    fn create(&self, events: EngineEventSink) -> Box<dyn NegotiationEngine> {
        Box::new(RtcEngine::new(self.ice_servers.clone(), events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_shared::CallId;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_unattached_engine_refuses_negotiation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = RtcEngine::new(default_ice_servers(), EngineEventSink::new(CallId::new(), tx));

        assert_eq!(engine.create_offer().await, Err(MediaError::NotAttached));
        assert_eq!(
            engine.add_remote_candidate("{}".into()).await,
            Err(MediaError::NotAttached)
        );
        engine.close().await;
    }

    #[test]
    fn test_default_ice_servers() {
        let factory = RtcEngineFactory::default();
        assert_eq!(factory.ice_servers.len(), 2);
        assert!(factory.ice_servers.iter().all(|s| s.starts_with("stun:")));
    }
}
