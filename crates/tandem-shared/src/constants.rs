/// Application name
pub const APP_NAME: &str = "Tandem";

/// Prefix of every generated room id
pub const ROOM_ID_PREFIX: &str = "room_";

/// Random bytes behind a room id (hex-encoded on the wire)
pub const ROOM_ID_BYTES: usize = 32;

/// Default time a call may ring before it is marked missed
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 30;

/// Default interval of the stale-ringing sweep
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;

/// Default number of calls returned by the history endpoint
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Outbound event queue per live connection
pub const CONNECTION_QUEUE_CAPACITY: usize = 64;

/// Client heartbeat interval on the signaling socket
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Public STUN servers used when no ICE servers are configured
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
