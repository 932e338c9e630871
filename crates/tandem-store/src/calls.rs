//! CRUD operations for [`CallRecord`] rows.
//!
//! Status changes never go through a plain `UPDATE`: callers describe the
//! change with a [`CallChange`] and the statuses they expect the row to be
//! in, and [`Database::transition_call`] applies it only if that still holds.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tandem_shared::call::pair_key;
use tandem_shared::{CallId, CallRecord, CallStatus, MediaKind, RoomId, UserId};
use uuid::Uuid;

use crate::database::{conversion_failure, parse_timestamp, timestamp, Database};
use crate::error::{Result, StoreError};

const CALL_COLUMNS: &str = "id, caller_id, receiver_id, status, media_kind, start_time, \
                            end_time, duration, room_id, created_at, updated_at";

/// A status change applied by [`Database::transition_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallChange {
    /// `ringing -> connected`; the start instant moves to the answer instant.
    Connect { at: DateTime<Utc> },
    /// Move to a terminal status, stamping the end instant.
    Finish {
        status: CallStatus,
        at: DateTime<Utc>,
    },
}

impl CallChange {
    pub fn target(&self) -> CallStatus {
        match self {
            Self::Connect { .. } => CallStatus::Connected,
            Self::Finish { status, .. } => *status,
        }
    }

    pub fn apply(&self, call: &mut CallRecord) {
        match *self {
            Self::Connect { at } => {
                call.status = CallStatus::Connected;
                call.start_time = at;
                call.updated_at = at;
            }
            Self::Finish { status, at } => {
                call.status = status;
                call.set_end_time(at);
                call.updated_at = at;
            }
        }
    }
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new call record.
    ///
    /// Fails with [`StoreError::Conflict`] when the pair already has a
    /// ringing or connected call, or on a room id collision.
    pub fn insert_call(&self, call: &CallRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO calls (id, caller_id, receiver_id, pair_key, status, media_kind,
                                    start_time, end_time, duration, room_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    call.id.to_string(),
                    call.caller_id.to_string(),
                    call.receiver_id.to_string(),
                    call.pair_key(),
                    call.status.as_str(),
                    call.media_kind.as_str(),
                    timestamp(&call.start_time),
                    call.end_time.as_ref().map(timestamp),
                    call.duration as i64,
                    call.room_id.as_str(),
                    timestamp(&call.created_at),
                    timestamp(&call.updated_at),
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single call by id.
    pub fn get_call(&self, id: CallId) -> Result<CallRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id.to_string()],
                row_to_call,
            )
            .map_err(StoreError::from_lookup)
    }

    /// The ringing or connected call between two users, in either direction.
    pub fn find_active_call_between(&self, a: &UserId, b: &UserId) -> Result<Option<CallRecord>> {
        let call = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CALL_COLUMNS} FROM calls
                     WHERE pair_key = ?1 AND status IN ('ringing', 'connected')"
                ),
                params![pair_key(a, b)],
                row_to_call,
            )
            .optional()?;
        Ok(call)
    }

    /// The most recent ringing or connected call involving `user`.
    pub fn find_active_call_for_user(&self, user: &UserId) -> Result<Option<CallRecord>> {
        let call = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CALL_COLUMNS} FROM calls
                     WHERE (caller_id = ?1 OR receiver_id = ?1)
                       AND status IN ('ringing', 'connected')
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1"
                ),
                params![user.to_string()],
                row_to_call,
            )
            .optional()?;
        Ok(call)
    }

    /// Calls `user` took part in, newest first.
    pub fn list_calls_for_user(&self, user: &UserId, limit: u32) -> Result<Vec<CallRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM calls
             WHERE caller_id = ?1 OR receiver_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![user.to_string(), limit], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    /// Calls still ringing whose ring started at or before `instant`.
    pub fn list_ringing_started_before(&self, instant: DateTime<Utc>) -> Result<Vec<CallRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CALL_COLUMNS} FROM calls
             WHERE status = 'ringing' AND start_time <= ?1
             ORDER BY start_time ASC"
        ))?;

        let rows = stmt.query_map(params![timestamp(&instant)], row_to_call)?;

        let mut calls = Vec::new();
        for row in rows {
            calls.push(row?);
        }
        Ok(calls)
    }

    pub fn count_active_calls(&self) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM calls WHERE status IN ('ringing', 'connected')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Conditionally apply `change` to call `id`.
    ///
    /// Returns the updated record, or `Ok(None)` if the call's status is not
    /// one of `expected` (the caller lost a race or the call moved on).
    /// Fails with [`StoreError::NotFound`] for an unknown id.
    pub fn transition_call(
        &mut self,
        id: CallId,
        expected: &[CallStatus],
        change: CallChange,
    ) -> Result<Option<CallRecord>> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut call = tx
            .query_row(
                &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
                params![id.to_string()],
                row_to_call,
            )
            .map_err(StoreError::from_lookup)?;

        if !expected.contains(&call.status) {
            return Ok(None);
        }

        let previous = call.status;
        change.apply(&mut call);

        let affected = tx
            .execute(
                "UPDATE calls
                 SET status = ?1, start_time = ?2, end_time = ?3, duration = ?4, updated_at = ?5
                 WHERE id = ?6 AND status = ?7",
                params![
                    call.status.as_str(),
                    timestamp(&call.start_time),
                    call.end_time.as_ref().map(timestamp),
                    call.duration as i64,
                    timestamp(&call.updated_at),
                    id.to_string(),
                    previous.as_str(),
                ],
            )
            .map_err(StoreError::from_write)?;

        if affected == 0 {
            return Ok(None);
        }

        tx.commit()?;
        Ok(Some(call))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct UnknownValue(String);

impl std::fmt::Display for UnknownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown value '{}'", self.0)
    }
}

impl std::error::Error for UnknownValue {}

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| conversion_failure(idx, e))
}

/// Map a `rusqlite::Row` selected with `CALL_COLUMNS` to a [`CallRecord`].
fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
    let id_str: String = row.get(0)?;
    let caller_str: String = row.get(1)?;
    let receiver_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let kind_str: String = row.get(4)?;
    let start_str: String = row.get(5)?;
    let end_str: Option<String> = row.get(6)?;
    let duration: i64 = row.get(7)?;
    let room_id: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    let status = CallStatus::parse(&status_str)
        .ok_or_else(|| conversion_failure(3, UnknownValue(status_str.clone())))?;
    let media_kind = MediaKind::parse(&kind_str)
        .ok_or_else(|| conversion_failure(4, UnknownValue(kind_str.clone())))?;

    Ok(CallRecord {
        id: CallId(parse_uuid(0, &id_str)?),
        caller_id: UserId(parse_uuid(1, &caller_str)?),
        receiver_id: UserId(parse_uuid(2, &receiver_str)?),
        status,
        media_kind,
        start_time: parse_timestamp(5, &start_str)?,
        end_time: end_str.map(|s| parse_timestamp(6, &s)).transpose()?,
        duration: duration.max(0) as u64,
        room_id: RoomId(room_id),
        created_at: parse_timestamp(9, &created_str)?,
        updated_at: parse_timestamp(10, &updated_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn ringing(db: &Database, caller: UserId, receiver: UserId, at: DateTime<Utc>) -> CallRecord {
        let call = CallRecord::ringing(caller, receiver, MediaKind::Audio, at);
        db.insert_call(&call).unwrap();
        call
    }

    #[test]
    fn insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let call = ringing(&db, UserId::new(), UserId::new(), t0());

        let loaded = db.get_call(call.id).unwrap();
        assert_eq!(loaded, call);
    }

    #[test]
    fn get_unknown_call() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(db.get_call(CallId::new()), Err(StoreError::NotFound)));
    }

    #[test]
    fn second_active_call_for_pair_conflicts_in_either_direction() {
        let db = Database::open_in_memory().unwrap();
        let x = UserId::new();
        let y = UserId::new();
        ringing(&db, x, y, t0());

        let reverse = CallRecord::ringing(y, x, MediaKind::Video, t0());
        assert!(matches!(db.insert_call(&reverse), Err(StoreError::Conflict(_))));

        // Other pairs are unaffected.
        ringing(&db, x, UserId::new(), t0());
        assert_eq!(db.count_active_calls().unwrap(), 2);
    }

    #[test]
    fn ended_call_frees_the_pair() {
        let mut db = Database::open_in_memory().unwrap();
        let x = UserId::new();
        let y = UserId::new();
        let call = ringing(&db, x, y, t0());

        let change = CallChange::Finish {
            status: CallStatus::Ended,
            at: t0() + Duration::seconds(3),
        };
        db.transition_call(call.id, &CallStatus::ACTIVE, change)
            .unwrap()
            .unwrap();

        assert!(db.find_active_call_between(&y, &x).unwrap().is_none());
        ringing(&db, y, x, t0() + Duration::seconds(10));
        assert!(db.find_active_call_between(&x, &y).unwrap().is_some());
    }

    #[test]
    fn connect_moves_start_time_and_end_computes_duration() {
        let mut db = Database::open_in_memory().unwrap();
        let call = ringing(&db, UserId::new(), UserId::new(), t0());

        let answered_at = t0() + Duration::seconds(7);
        let connected = db
            .transition_call(call.id, &[CallStatus::Ringing], CallChange::Connect { at: answered_at })
            .unwrap()
            .unwrap();
        assert_eq!(connected.status, CallStatus::Connected);
        assert_eq!(connected.start_time, answered_at);

        let ended = db
            .transition_call(
                call.id,
                &CallStatus::ACTIVE,
                CallChange::Finish {
                    status: CallStatus::Ended,
                    at: answered_at + Duration::milliseconds(42_500),
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(ended.duration, 42);
        assert_eq!(db.get_call(call.id).unwrap(), ended);
    }

    #[test]
    fn transition_with_stale_precondition_is_refused() {
        let mut db = Database::open_in_memory().unwrap();
        let call = ringing(&db, UserId::new(), UserId::new(), t0());

        let reject = CallChange::Finish {
            status: CallStatus::Rejected,
            at: t0() + Duration::seconds(1),
        };
        assert!(db
            .transition_call(call.id, &[CallStatus::Ringing], reject)
            .unwrap()
            .is_some());

        // The racing answer loses and must not touch the row.
        let answer = CallChange::Connect {
            at: t0() + Duration::seconds(2),
        };
        assert!(db
            .transition_call(call.id, &[CallStatus::Ringing], answer)
            .unwrap()
            .is_none());
        assert_eq!(db.get_call(call.id).unwrap().status, CallStatus::Rejected);
    }

    #[test]
    fn transition_unknown_call() {
        let mut db = Database::open_in_memory().unwrap();
        let result = db.transition_call(
            CallId::new(),
            &[CallStatus::Ringing],
            CallChange::Connect { at: t0() },
        );
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let mut db = Database::open_in_memory().unwrap();
        let me = UserId::new();

        let mut ids = Vec::new();
        for i in 0..3 {
            let at = t0() + Duration::minutes(i);
            let call = ringing(&db, me, UserId::new(), at);
            db.transition_call(
                call.id,
                &CallStatus::ACTIVE,
                CallChange::Finish {
                    status: CallStatus::Missed,
                    at,
                },
            )
            .unwrap();
            ids.push(call.id);
        }
        // A call between two other users never shows up.
        ringing(&db, UserId::new(), UserId::new(), t0());

        let history = db.list_calls_for_user(&me, 2).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);
    }

    #[test]
    fn active_call_for_user_as_receiver() {
        let db = Database::open_in_memory().unwrap();
        let receiver = UserId::new();
        let call = ringing(&db, UserId::new(), receiver, t0());

        let active = db.find_active_call_for_user(&receiver).unwrap().unwrap();
        assert_eq!(active.id, call.id);
        assert!(db.find_active_call_for_user(&UserId::new()).unwrap().is_none());
    }

    #[test]
    fn ringing_before_cutoff() {
        let mut db = Database::open_in_memory().unwrap();
        let old = ringing(&db, UserId::new(), UserId::new(), t0());
        let fresh = ringing(&db, UserId::new(), UserId::new(), t0() + Duration::seconds(40));
        let answered = ringing(&db, UserId::new(), UserId::new(), t0());
        db.transition_call(
            answered.id,
            &[CallStatus::Ringing],
            CallChange::Connect { at: t0() + Duration::seconds(1) },
        )
        .unwrap();

        let stale = db
            .list_ringing_started_before(t0() + Duration::seconds(30))
            .unwrap();
        let ids: Vec<_> = stale.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![old.id]);
        assert_ne!(ids[0], fresh.id);
    }

    #[test]
    fn self_call_rejected_by_schema() {
        let db = Database::open_in_memory().unwrap();
        let me = UserId::new();
        let call = CallRecord::ringing(me, me, MediaKind::Audio, t0());
        assert!(matches!(db.insert_call(&call), Err(StoreError::Conflict(_))));
    }
}
