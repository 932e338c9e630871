//! Client-side media negotiation for one call.
//!
//! [`NegotiationSession`] is the pure offer/answer/candidate state,
//! [`MediaCoordinator`] drives it against a [`NegotiationEngine`] and the
//! locally captured [`LocalMedia`], and [`RtcEngine`] is the WebRTC-backed
//! engine used by real clients. [`SystemDevices`] finds the host's
//! microphone and camera.

pub mod capture;
pub mod coordinator;
pub mod engine;
pub mod negotiation;
pub mod rtc;

pub use capture::{CaptureHost, NativeHost, SystemDevices};
pub use coordinator::{CoordinatorEvent, MediaCoordinator, SignalSink};
pub use engine::{
    EngineEvent, EngineEventSink, EngineFactory, LocalMedia, LocalTrack, MediaDevices,
    MediaError, NegotiationEngine, TrackKind,
};
#[cfg(any(test, feature = "test-util"))]
pub use engine::DeviceInventory;
pub use negotiation::{NegotiationAction, NegotiationPhase, NegotiationRole, NegotiationSession};
pub use rtc::{RtcEngine, RtcEngineFactory};
