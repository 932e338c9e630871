//! Media capture and negotiation engine abstractions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tandem_shared::{CallId, MediaKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("No local media attached")]
    NotAttached,

    #[error("Signaling channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured track. Clones share the live and enabled flags, so the
/// capture side observes when the owning [`LocalMedia`] stops or mutes it.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub kind: TrackKind,
    pub id: String,
    /// Capture device backing the track, when known.
    pub device: Option<String>,
    live: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            device: None,
            live: Arc::new(AtomicBool::new(true)),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// A disabled track stays attached but its capture sends silence or
    /// black frames.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns whether the flag changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst) != enabled
    }

    fn stop(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }
}

/// Locally captured media for one call.
///
/// Tracks are stopped by [`LocalMedia::stop`] or, failing that, on drop.
#[derive(Debug)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }

    /// Enable or disable every track of `kind`. Returns how many changed.
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let changed = self
            .tracks
            .iter()
            .filter(|t| t.kind == kind)
            .filter(|t| t.set_enabled(enabled))
            .count();
        if changed > 0 {
            debug!(?kind, enabled, "local tracks toggled");
        }
        changed
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Stop every track. Returns how many were still live.
    pub fn stop(&mut self) -> usize {
        let stopped = self.tracks.iter().filter(|t| t.stop()).count();
        if stopped > 0 {
            debug!(tracks = stopped, "local media released");
        }
        stopped
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture audio, plus video for video calls.
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError>;
}

/// Capture backed by a declared set of available devices. Never touches
/// hardware; real clients use [`crate::SystemDevices`].
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Clone, Copy)]
pub struct DeviceInventory {
    pub microphone: bool,
    pub camera: bool,
}

#[cfg(any(test, feature = "test-util"))]
impl DeviceInventory {
    pub fn new(microphone: bool, camera: bool) -> Self {
        Self { microphone, camera }
    }

    pub fn full() -> Self {
        Self::new(true, true)
    }

    pub fn audio_only() -> Self {
        Self::new(true, false)
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Default for DeviceInventory {
    fn default() -> Self {
        Self::full()
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl MediaDevices for DeviceInventory {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalMedia, MediaError> {
        if !self.microphone {
            return Err(MediaError::DeviceUnavailable("no microphone".into()));
        }
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, "audio")];

        if kind.wants_video() {
            if !self.camera {
                return Err(MediaError::DeviceUnavailable("no camera".into()));
            }
            tracks.push(LocalTrack::new(TrackKind::Video, "video"));
        }

        Ok(LocalMedia::new(tracks))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Serialized local candidate to relay to the other party.
    LocalCandidate(String),
    Connected,
    RemoteTrack(TrackKind),
    Failed(String),
}

/// Sending half handed to an engine. Every event is tagged with its call so
/// that late events from a torn-down engine can be told apart.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    call_id: CallId,
    tx: mpsc::UnboundedSender<(CallId, EngineEvent)>,
}

impl EngineEventSink {
    pub fn new(call_id: CallId, tx: mpsc::UnboundedSender<(CallId, EngineEvent)>) -> Self {
        Self { call_id, tx }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx.send((self.call_id, event)).is_ok()
    }
}

/// A peer connection able to run one offer/answer exchange.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn attach(&mut self, media: &LocalMedia) -> Result<(), MediaError>;

    /// Create an offer and apply it locally.
    async fn create_offer(&mut self) -> Result<String, MediaError>;

    /// Apply a remote offer and return the local answer.
    async fn accept_offer(&mut self, offer: String) -> Result<String, MediaError>;

    async fn accept_answer(&mut self, answer: String) -> Result<(), MediaError>;

    async fn add_remote_candidate(&mut self, candidate: String) -> Result<(), MediaError>;

    async fn close(&mut self);
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, events: EngineEventSink) -> Box<dyn NegotiationEngine>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audio_call_captures_audio_only() {
        let media = DeviceInventory::full().acquire(MediaKind::Audio).await.unwrap();
        assert_eq!(media.tracks().len(), 1);
        assert!(!media.has(TrackKind::Video));
    }

    #[tokio::test]
    async fn test_video_call_without_camera_fails() {
        let err = DeviceInventory::audio_only()
            .acquire(MediaKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::DeviceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut media = DeviceInventory::full().acquire(MediaKind::Video).await.unwrap();
        assert_eq!(media.stop(), 2);
        assert_eq!(media.stop(), 0);
        assert!(!media.is_live());
    }

    #[tokio::test]
    async fn test_toggle_only_touches_matching_kind() {
        let media = DeviceInventory::full().acquire(MediaKind::Video).await.unwrap();
        let (audio, video) = (media.tracks()[0].clone(), media.tracks()[1].clone());

        assert_eq!(media.set_enabled(TrackKind::Audio, false), 1);
        assert_eq!(media.set_enabled(TrackKind::Audio, false), 0);
        assert!(!audio.is_enabled());
        assert!(video.is_enabled());
        assert!(audio.is_live());

        assert_eq!(media.set_enabled(TrackKind::Audio, true), 1);
        assert!(audio.is_enabled());
    }

    #[tokio::test]
    async fn test_drop_releases_tracks() {
        let media = DeviceInventory::full().acquire(MediaKind::Video).await.unwrap();
        let observer = media.tracks()[1].clone();
        assert!(observer.is_live());
        drop(media);
        assert!(!observer.is_live());
    }

    #[test]
    fn test_event_sink_tags_call() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let call_id = CallId::new();
        let sink = EngineEventSink::new(call_id, tx);
        assert!(sink.emit(EngineEvent::Connected));
        assert_eq!(rx.try_recv().unwrap(), (call_id, EngineEvent::Connected));

        drop(rx);
        assert!(!sink.emit(EngineEvent::Connected));
    }
}
