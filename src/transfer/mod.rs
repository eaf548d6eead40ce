//! Chunked file transfer over an ordered, reliable peer-to-peer channel.
//!
//! # Protocol overview
//!
//! - Control messages are UTF-8 JSON text: `{"type":"meta",…}` announces a
//!   file, `{"type":"isCompleted",…}` marks it done.
//! - Data messages are binary: an 8-byte header (u32 BE chunk index,
//!   u32 BE total chunks) followed by up to [`CHUNK_SIZE`] payload bytes.
//! - Files are sent strictly serially — two files' chunks are never
//!   interleaved on one channel.
//! - The sender applies backpressure against the channel's buffered byte
//!   count and waits for a full drain before emitting the completion
//!   marker.
//!
//! The index header is redundant while the channel is ordered and
//! reliable; the receiver is nevertheless written order-tolerant so a
//! future relaxation of ordering (e.g. parallel channels) cannot corrupt
//! reassembly.
//!
//! [`CHUNK_SIZE`]: crate::config::CHUNK_SIZE

pub mod receiver;
pub mod sender;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Bytes of framing prepended to every binary chunk message.
pub const CHUNK_HEADER_LEN: usize = 8;

// ── Control messages ─────────────────────────────────────────────────────────

/// JSON control messages sent as text on the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferControl {
    /// Announces the file that the following chunks belong to.
    #[serde(rename = "meta", rename_all = "camelCase")]
    Meta {
        name: String,
        size: u64,
        total_chunks: u32,
    },
    /// Explicit completion marker; a file is never considered done
    /// without it, even once every chunk has been stored.
    #[serde(rename = "isCompleted")]
    IsCompleted { name: String },
}

// ── Binary chunk framing ─────────────────────────────────────────────────────

/// A decoded binary chunk message borrowing the payload from the frame.
#[derive(Debug, PartialEq, Eq)]
pub struct ChunkFrame<'a> {
    /// Zero-based position of the payload within the file.
    pub index: u32,
    /// Total chunk count of the file this chunk belongs to; the receiver
    /// uses it to locate the target transfer.
    pub total_chunks: u32,
    pub payload: &'a [u8],
}

/// Encode `[index BE][total_chunks BE][payload]` into a reusable buffer,
/// clearing it first.
pub fn encode_chunk_frame_into(buf: &mut Vec<u8>, index: u32, total_chunks: u32, payload: &[u8]) {
    buf.clear();
    buf.reserve(CHUNK_HEADER_LEN + payload.len());
    buf.put_u32(index);
    buf.put_u32(total_chunks);
    buf.extend_from_slice(payload);
}

/// Decode a binary chunk message. Returns `None` for frames too short to
/// carry a header (dropped silently by the receiver).
pub fn decode_chunk_frame(data: &[u8]) -> Option<ChunkFrame<'_>> {
    if data.len() < CHUNK_HEADER_LEN {
        return None;
    }
    let index = u32::from_be_bytes(data[0..4].try_into().ok()?);
    let total_chunks = u32::from_be_bytes(data[4..8].try_into().ok()?);
    Some(ChunkFrame {
        index,
        total_chunks,
        payload: &data[CHUNK_HEADER_LEN..],
    })
}

/// Number of chunks needed to cover `size` bytes at `chunk_size`.
///
/// A zero-byte file has zero chunks: its meta message is followed
/// immediately by the completion marker.
pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

// ── Channel seam ─────────────────────────────────────────────────────────────

/// The ordered, reliable byte/message transport the protocol runs over.
///
/// Implemented by the WebRTC data channel wrapper and by in-memory test
/// channels. `buffered_amount` reports bytes accepted for send but not
/// yet handed to the transport — the quantity backpressure is applied to.
#[async_trait]
pub trait TransferChannel: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    async fn buffered_amount(&self) -> usize;

    async fn close(&self) -> Result<()>;
}

// ── App-facing events ────────────────────────────────────────────────────────

/// Progress and completion events delivered to the application layer.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Receiver: a meta message opened a new incoming file.
    Started {
        name: String,
        size: u64,
        total_chunks: u32,
    },
    /// Receiver: a chunk was stored.
    Progress {
        name: String,
        received_size: u64,
        size: u64,
    },
    /// Receiver: all slots filled and the completion marker arrived;
    /// `data` is the reassembled byte sequence, ready to save.
    Completed { name: String, data: Bytes },
    /// Sender: a file's chunks are on the wire.
    SendProgress {
        name: String,
        sent_chunks: u32,
        total_chunks: u32,
    },
    /// Sender: the channel drained and the completion marker was sent.
    SendComplete { name: String },
}

/// Forward a [`TransferEvent`] to the application channel, if present.
///
/// No-op when `events` is `None` (headless operation or tests).
pub(crate) fn notify_app(events: &Option<mpsc::UnboundedSender<TransferEvent>>, msg: TransferEvent) {
    if let Some(tx) = events {
        let _ = tx.send(msg);
    }
}
