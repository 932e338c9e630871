use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{ROOM_ID_BYTES, ROOM_ID_PREFIX};

// User identity as issued by the auth service. Always a plain id, never a
// populated profile object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token scoping one call's signaling and media session.
///
/// Generated from the OS CSPRNG so that it cannot be guessed from the
/// creation time of the call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; ROOM_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(format!("{}{}", ROOM_ID_PREFIX, hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }

    /// Whether a camera track is captured for this kind of call.
    pub fn wants_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Connected,
    Ended,
    Missed,
    Rejected,
}

impl CallStatus {
    pub const ACTIVE: [CallStatus; 2] = [CallStatus::Ringing, CallStatus::Connected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ringing" => Some(Self::Ringing),
            "connected" => Some(Self::Connected),
            "ended" => Some(Self::Ended),
            "missed" => Some(Self::Missed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ringing | Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a call a participant is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Receiver,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_ids_are_unique_and_long() {
        let a = RoomId::generate();
        let b = RoomId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(ROOM_ID_PREFIX));
        assert_eq!(a.as_str().len(), ROOM_ID_PREFIX.len() + ROOM_ID_BYTES * 2);
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_status_round_trip_and_activity() {
        for status in [
            CallStatus::Ringing,
            CallStatus::Connected,
            CallStatus::Ended,
            CallStatus::Missed,
            CallStatus::Rejected,
        ] {
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
        assert!(CallStatus::Ringing.is_active());
        assert!(CallStatus::Connected.is_active());
        assert!(CallStatus::Missed.is_terminal());
        assert_eq!(CallStatus::parse("busy"), None);
    }

    #[test]
    fn test_media_kind_defaults_to_audio() {
        assert_eq!(MediaKind::default(), MediaKind::Audio);
        assert!(MediaKind::Video.wants_video());
        assert!(!MediaKind::Audio.wants_video());
    }
}
