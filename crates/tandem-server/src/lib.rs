//! # tandem-server
//!
//! Call signaling service.
//!
//! - **Call state machine** ([`calls`]): the only writer of call records,
//!   with a ring timer and a periodic sweep for unanswered calls
//! - **Session registry** and **signaling relay**: one live WebSocket per
//!   user, best-effort delivery of lifecycle events and negotiation payloads
//! - **REST API** (axum) for call control, history, health and admin
//! - **Per-IP rate limiting** in front of every route

pub mod api;
pub mod auth;
pub mod calls;
pub mod clock;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod ws;

pub use api::{build_router, serve, AppState};
pub use calls::{CallService, CallSettings};
pub use config::ServerConfig;
pub use error::ServerError;
