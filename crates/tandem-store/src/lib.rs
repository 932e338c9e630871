//! # tandem-store
//!
//! SQLite persistence for call records and the user directory.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`. The one-active-call-per-pair rule is enforced by
//! the schema itself, and every status change goes through the conditional
//! [`Database::transition_call`] primitive.

pub mod calls;
pub mod database;
pub mod migrations;
pub mod users;

mod error;

pub use calls::CallChange;
pub use database::Database;
pub use error::{Result, StoreError};
pub use tandem_shared::User;
