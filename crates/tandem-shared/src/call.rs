//! The persisted record of one call attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{CallId, CallRole, CallStatus, MediaKind, RoomId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub status: CallStatus,
    pub media_kind: MediaKind,
    /// Ring start, replaced by the answer instant once connected.
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Whole seconds between `start_time` and `end_time`.
    pub duration: u64,
    pub room_id: RoomId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// A fresh ringing call with a newly generated room id.
    pub fn ringing(
        caller_id: UserId,
        receiver_id: UserId,
        media_kind: MediaKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CallId::new(),
            caller_id,
            receiver_id,
            status: CallStatus::Ringing,
            media_kind,
            start_time: now,
            end_time: None,
            duration: 0,
            room_id: RoomId::generate(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_participant(&self, user: &UserId) -> bool {
        self.caller_id == *user || self.receiver_id == *user
    }

    pub fn role_of(&self, user: &UserId) -> Option<CallRole> {
        if self.caller_id == *user {
            Some(CallRole::Caller)
        } else if self.receiver_id == *user {
            Some(CallRole::Receiver)
        } else {
            None
        }
    }

    /// The other participant, or `None` when `user` is not on this call.
    pub fn counterpart(&self, user: &UserId) -> Option<UserId> {
        match self.role_of(user)? {
            CallRole::Caller => Some(self.receiver_id),
            CallRole::Receiver => Some(self.caller_id),
        }
    }

    /// Order-independent key for the participant pair.
    pub fn pair_key(&self) -> String {
        pair_key(&self.caller_id, &self.receiver_id)
    }

    /// Set the end instant and recompute `duration`.
    pub fn set_end_time(&mut self, end: DateTime<Utc>) {
        self.end_time = Some(end);
        self.duration = duration_secs(self.start_time, end);
    }
}

pub fn pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

fn duration_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    if start < end {
        (end - start).num_seconds().max(0) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_call_is_ringing_with_zero_duration() {
        let now = Utc::now();
        let call = CallRecord::ringing(UserId::new(), UserId::new(), MediaKind::Video, now);
        assert_eq!(call.status, CallStatus::Ringing);
        assert_eq!(call.start_time, now);
        assert_eq!(call.duration, 0);
        assert!(call.end_time.is_none());
    }

    #[test]
    fn test_duration_is_whole_seconds() {
        let now = Utc::now();
        let mut call = CallRecord::ringing(UserId::new(), UserId::new(), MediaKind::Audio, now);
        call.set_end_time(now + Duration::milliseconds(12_900));
        assert_eq!(call.duration, 12);
    }

    #[test]
    fn test_duration_zero_when_end_precedes_start() {
        let now = Utc::now();
        let mut call = CallRecord::ringing(UserId::new(), UserId::new(), MediaKind::Audio, now);
        call.set_end_time(now - Duration::seconds(5));
        assert_eq!(call.duration, 0);
        assert!(call.end_time.is_some());
    }

    #[test]
    fn test_counterpart() {
        let caller = UserId::new();
        let receiver = UserId::new();
        let call = CallRecord::ringing(caller, receiver, MediaKind::Audio, Utc::now());
        assert_eq!(call.counterpart(&caller), Some(receiver));
        assert_eq!(call.counterpart(&receiver), Some(caller));
        assert_eq!(call.counterpart(&UserId::new()), None);
        assert_eq!(call.role_of(&receiver), Some(CallRole::Receiver));
    }

    #[test]
    fn test_pair_key_is_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(pair_key(&a, &b), pair_key(&b, &a));
        assert_ne!(pair_key(&a, &b), pair_key(&a, &UserId::new()));
    }
}
