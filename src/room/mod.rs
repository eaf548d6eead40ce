//! Multi-peer A/V rooms.
//!
//! A room is a full mesh: every participant holds one peer connection
//! per other participant, negotiated through a room socket that routes
//! `{event, data, senderId}` envelopes. The server addresses directed
//! events by `targetId`; a client only ever receives envelopes meant
//! for it.

pub mod registry;

pub use registry::{join_room, RoomHandle, RoomUpdate};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

// ── Wire types ───────────────────────────────────────────────────────────────

/// One room socket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEnvelope {
    #[serde(flatten)]
    pub event: RoomEvent,
    /// Identity of the originating participant; set by the server on
    /// directed events, absent on membership notifications it authors.
    #[serde(rename = "senderId", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

/// Room events, tagged exactly as they appear on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// Sent to the joiner: everyone already in the room (including the
    /// joiner itself).
    RoomJoined { participants: Vec<String> },
    /// Broadcast to existing members when someone joins.
    ParticipantJoined {
        #[serde(rename = "joinedId")]
        joined_id: String,
    },
    /// Broadcast when someone leaves or disconnects.
    ParticipantLeft {
        #[serde(rename = "leftId")]
        left_id: String,
    },
    WebrtcOffer {
        #[serde(rename = "targetId")]
        target_id: String,
        payload: Value,
    },
    WebrtcAnswer {
        #[serde(rename = "targetId")]
        target_id: String,
        payload: Value,
    },
    IceCandidate {
        #[serde(rename = "targetId")]
        target_id: String,
        payload: Value,
    },
}

// ── Socket seam ──────────────────────────────────────────────────────────────

/// A joined room connection, as handed out by the socket layer.
pub struct RoomSubscription {
    /// This client's participant id, assigned by the server.
    pub local_id: String,
    /// Inbound envelopes in server delivery order.
    pub envelopes: mpsc::UnboundedReceiver<RoomEnvelope>,
}

/// Outbound half of the room socket.
#[async_trait]
pub trait RoomSocket: Send + Sync {
    /// Send one event to the server (which routes directed events by
    /// `targetId`).
    async fn send(&self, event: RoomEvent) -> Result<()>;

    /// Leave the room and release the connection. Idempotent.
    async fn leave(&self);
}
