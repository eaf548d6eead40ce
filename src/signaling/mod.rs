//! Signaling relay interface.
//!
//! The relay is an external pub/sub service (the core never implements the
//! server side): peers that cannot yet talk directly exchange small JSON
//! frames through named channels. Delivery is best-effort, at-least-once,
//! and ordered only *per event type* — an `ice-candidate` may arrive before
//! the `offer` it relates to, which is why the session layer keeps a
//! candidate buffer.
//!
//! The relay client is an explicitly constructed, explicitly torn-down
//! value owned by the caller; there is no ambient singleton.

mod memory;

pub use memory::{InMemoryRelay, RelayBus};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

// ── Wire frames ──────────────────────────────────────────────────────────────

/// Event names used on a point-to-point signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Responder announcing it has subscribed and is ready for an offer.
    Ready,
    /// SDP offer from the initiating peer.
    Offer,
    /// SDP answer from the responding peer.
    Answer,
    /// ICE candidate for NAT traversal, from either side.
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Ready => "ready",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

/// One signaling message: an event name plus an opaque JSON payload.
///
/// Frames are immutable and fire-and-forget; there is no acknowledgement
/// beyond relay-level delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalFrame {
    pub event: SignalKind,
    pub payload: Value,
}

impl SignalFrame {
    pub fn ready() -> Self {
        Self {
            event: SignalKind::Ready,
            payload: Value::Object(Default::default()),
        }
    }

    pub fn offer(sdp: Value) -> Self {
        Self {
            event: SignalKind::Offer,
            payload: sdp,
        }
    }

    pub fn answer(sdp: Value) -> Self {
        Self {
            event: SignalKind::Answer,
            payload: sdp,
        }
    }

    pub fn ice_candidate(candidate: Value) -> Self {
        Self {
            event: SignalKind::IceCandidate,
            payload: candidate,
        }
    }
}

// ── Relay client interface ───────────────────────────────────────────────────

/// A live subscription to one relay channel.
///
/// Dropping the subscription stops delivery; `SignalingRelay::unsubscribe`
/// additionally releases the channel on the relay side and is safe to call
/// whether or not the subscription is still alive.
pub struct RelaySubscription {
    /// Name of the subscribed channel.
    pub channel: String,
    /// Inbound frames, in relay delivery order.
    pub frames: mpsc::UnboundedReceiver<SignalFrame>,
}

/// Client interface to the signaling relay.
///
/// `publish` failures are surfaced to the caller as errors and are never
/// retried automatically. `unsubscribe` must be idempotent.
#[async_trait]
pub trait SignalingRelay: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<RelaySubscription>;

    async fn publish(&self, channel: &str, frame: SignalFrame) -> Result<()>;

    async fn unsubscribe(&self, channel: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_kind_wire_names() {
        assert_eq!(SignalKind::Ready.as_str(), "ready");
        assert_eq!(SignalKind::IceCandidate.as_str(), "ice-candidate");

        // serde names must match the hand-written ones used on the wire
        let json = serde_json::to_string(&SignalKind::IceCandidate).unwrap();
        assert_eq!(json, "\"ice-candidate\"");
        let kind: SignalKind = serde_json::from_str("\"offer\"").unwrap();
        assert_eq!(kind, SignalKind::Offer);
    }

    #[test]
    fn ready_frame_has_empty_object_payload() {
        let frame = SignalFrame::ready();
        assert_eq!(frame.payload, serde_json::json!({}));
    }
}
