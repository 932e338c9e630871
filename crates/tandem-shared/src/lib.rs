// Types shared by the tandem server, store, media and client crates.

pub mod call;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;
pub mod user;

pub use call::CallRecord;
pub use error::{CallError, TokenError};
pub use protocol::{ClientFrame, ServerEvent, Signal};
pub use token::SessionToken;
pub use types::{CallId, CallRole, CallStatus, MediaKind, RoomId, UserId};
pub use user::User;
