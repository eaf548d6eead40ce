//! Transport seam between session logic and the WebRTC engine.
//!
//! Session and room state machines never touch `RTCPeerConnection`
//! directly. They drive a [`PeerTransport`] with string-typed SDP and
//! candidate payloads (the exact JSON that crosses the relay) and react
//! to [`TransportSignal`]s fanned in over a channel. Tests substitute
//! scripted transports; production uses the implementation in
//! [`rtc`](super::rtc).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaTracks;
use crate::transfer::TransferChannel;

/// What kind of peer connection the factory should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// File sender: creates the data channel and the offer.
    DataInitiator,
    /// File receiver: waits for the remote data channel, answers.
    DataResponder,
    /// Room participant: local A/V tracks attached, no data channel.
    Media,
}

/// A message received on the peer data channel.
#[derive(Debug, Clone)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

/// Asynchronous notifications from the transport to its owning task.
pub enum TransportSignal {
    /// A local ICE candidate to forward over the signaling path, as the
    /// JSON the remote side will apply verbatim.
    LocalCandidate(String),
    /// The data channel reached the open state.
    ChannelOpen(Arc<dyn TransferChannel>),
    /// A message arrived on the data channel.
    ChannelMessage(ChannelPayload),
    /// The data channel closed.
    ChannelClosed,
    /// The remote peer added a media track.
    RemoteTrack(Arc<TrackRemote>),
    /// The connection failed or disconnected beyond recovery.
    Failed(String),
}

impl std::fmt::Debug for TransportSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            Self::ChannelMessage(p) => f.debug_tuple("ChannelMessage").field(p).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::RemoteTrack(_) => f.write_str("RemoteTrack"),
            Self::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// One peer connection, driven by its owning session or room task.
///
/// SDP and candidates are the serialized JSON forms exchanged over the
/// relay; the transport owns parsing and applying them.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create the local offer, set it as the local description and
    /// return its JSON for the signaling path.
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer, create and set the local answer, return
    /// the answer JSON.
    async fn apply_offer_and_answer(&self, offer: &str) -> Result<String>;

    /// Apply the remote answer to a previously created offer.
    async fn apply_answer(&self, answer: &str) -> Result<()>;

    /// Apply one remote ICE candidate. Requires a remote description;
    /// callers gate and buffer accordingly.
    async fn apply_candidate(&self, candidate: &str) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Builds peer transports; the seam that lets tests skip WebRTC.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Create a transport in `mode`, wiring its callbacks to
    /// `signals`. `tracks` are attached for [`TransportMode::Media`]
    /// and ignored otherwise.
    async fn create(
        &self,
        mode: TransportMode,
        signals: mpsc::UnboundedSender<TransportSignal>,
        tracks: Option<MediaTracks>,
    ) -> Result<Arc<dyn PeerTransport>>;
}
