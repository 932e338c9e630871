//! v001 -- Initial schema: the user directory and call records.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID
    display_name TEXT,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calls (
    id          TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    caller_id   TEXT NOT NULL,
    receiver_id TEXT NOT NULL,
    pair_key    TEXT NOT NULL,                -- sorted "lo:hi" participant ids
    status      TEXT NOT NULL
                CHECK (status IN ('ringing', 'connected', 'ended', 'missed', 'rejected')),
    media_kind  TEXT NOT NULL CHECK (media_kind IN ('audio', 'video')),
    start_time  TEXT NOT NULL,
    end_time    TEXT,
    duration    INTEGER NOT NULL DEFAULT 0,   -- whole seconds
    room_id     TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,

    CHECK (caller_id <> receiver_id)
);

-- At most one ringing or connected call per participant pair.
CREATE UNIQUE INDEX IF NOT EXISTS idx_calls_active_pair
    ON calls(pair_key) WHERE status IN ('ringing', 'connected');

CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_calls_receiver ON calls(receiver_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_calls_status_start ON calls(status, start_time);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
