//! Centralized configuration constants for ZippySend.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (chunk header layout, event
//! names) stay in their respective modules.

use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk payload size in bytes (64 KiB).
///
/// One chunk travels as one data channel message: an 8-byte header
/// (chunk index + total chunks, both u32 big-endian) followed by up to
/// this many payload bytes. The last chunk of a file may be shorter.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// High water mark for the data channel send buffer (bytes).
///
/// When `buffered_amount` exceeds this value, the sender pauses chunk
/// transmission until the buffer drains back below the mark. 4 MiB keeps
/// sender memory bounded while protecting receivers slower than the sender.
pub const BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024;

/// Polling cadence while waiting for the send buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── Session / Pairing ────────────────────────────────────────────────────────

/// Length of a human-shareable session code (uppercase base-36 characters).
pub const CODE_LENGTH: usize = 6;

/// How long an outbound session may sit unanswered before it is expired
/// and its resources reclaimed.
pub const SESSION_EXPIRY: Duration = Duration::from_secs(600);

/// Label of the single ordered, reliable data channel used for file bytes.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

// ── Network ──────────────────────────────────────────────────────────────────

/// Default STUN servers used when the caller supplies no ICE configuration.
///
/// Callers with TURN credentials pass their own list at session start;
/// the core never produces this configuration, only consumes it.
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec![
            "stun:stun1.l.google.com:19302".into(),
            "stun:stun2.l.google.com:19302".into(),
        ],
        ..Default::default()
    }]
}
