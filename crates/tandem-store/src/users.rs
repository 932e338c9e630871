//! The user directory: who exists and can therefore be called.

use rusqlite::{params, OptionalExtension};
use tandem_shared::{User, UserId};
use uuid::Uuid;

use crate::database::{conversion_failure, parse_timestamp, timestamp, Database};
use crate::error::{Result, StoreError};

impl Database {
    /// Insert a user, or update the display name of an existing one.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
            params![
                user.id.to_string(),
                user.display_name,
                timestamp(&user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(StoreError::from_lookup)
    }

    pub fn user_exists(&self, id: &UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn count_users(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let display_name: Option<String> = row.get(1)?;
    let created_str: String = row.get(2)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_failure(0, e))?;

    Ok(User {
        id: UserId(id),
        display_name,
        created_at: parse_timestamp(2, &created_str)?,
    })
}
