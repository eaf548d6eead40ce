//! WebRTC-backed [`PeerTransport`] implementation.
//!
//! Candidates are trickled: each local candidate is surfaced as a
//! [`TransportSignal::LocalCandidate`] the moment the ICE agent finds
//! it, rather than waiting for gathering to complete before producing
//! the SDP. The remote side applies them as they arrive.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{default_ice_servers, DATA_CHANNEL_LABEL};
use crate::media::MediaTracks;
use crate::transfer::TransferChannel;

use super::transport::{
    ChannelPayload, PeerTransport, TransportFactory, TransportMode, TransportSignal,
};

// ── Data channel wrapper ─────────────────────────────────────────────────────

/// [`TransferChannel`] over an `RTCDataChannel`.
pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl TransferChannel for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        let json = serde_json::to_string(&offer)?;
        self.pc.set_local_description(offer).await?;
        Ok(json)
    }

    async fn apply_offer_and_answer(&self, offer: &str) -> Result<String> {
        let desc: RTCSessionDescription = serde_json::from_str(offer)?;
        self.pc.set_remote_description(desc).await?;

        let answer = self.pc.create_answer(None).await?;
        let json = serde_json::to_string(&answer)?;
        self.pc.set_local_description(answer).await?;
        Ok(json)
    }

    async fn apply_answer(&self, answer: &str) -> Result<()> {
        let desc: RTCSessionDescription = serde_json::from_str(answer)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn apply_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Builds real peer connections against the configured ICE servers.
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcTransportFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    pub fn with_ice_servers(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }

    async fn new_peer_connection(&self, mode: TransportMode) -> Result<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        if mode == TransportMode::Media {
            media.register_default_codecs()?;
        }
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.ice_servers.clone(),
                ..Default::default()
            })
            .await?;
        Ok(Arc::new(pc))
    }
}

impl Default for RtcTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        mode: TransportMode,
        signals: mpsc::UnboundedSender<TransportSignal>,
        tracks: Option<MediaTracks>,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = self.new_peer_connection(mode).await?;

        wire_ice_trickle(&pc, signals.clone());
        wire_connection_state(&pc, signals.clone());

        match mode {
            TransportMode::DataInitiator => {
                let dc = pc
                    .create_data_channel(
                        DATA_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                attach_channel_handlers(&dc, signals);
            }
            TransportMode::DataResponder => {
                let signals_dc = signals;
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let signals = signals_dc.clone();
                    Box::pin(async move {
                        debug!(event = "data_channel_announced", label = %dc.label());
                        attach_channel_handlers(&dc, signals);
                    })
                }));
            }
            TransportMode::Media => {
                let tracks =
                    tracks.ok_or_else(|| anyhow!("media transport requires local tracks"))?;
                for track in tracks.into_track_locals() {
                    pc.add_track(track).await?;
                }
                let signals_track = signals;
                pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                    let signals = signals_track.clone();
                    Box::pin(async move {
                        debug!(
                            event = "remote_track_added",
                            kind = %track.kind(),
                            ssrc = track.ssrc(),
                        );
                        let _ = signals.send(TransportSignal::RemoteTrack(track));
                    })
                }));
            }
        }

        Ok(Arc::new(RtcTransport { pc }))
    }
}

fn wire_ice_trickle(
    pc: &Arc<RTCPeerConnection>,
    signals: mpsc::UnboundedSender<TransportSignal>,
) {
    pc.on_ice_candidate(Box::new(move |candidate| {
        let signals = signals.clone();
        Box::pin(async move {
            // `None` marks end of gathering; nothing to trickle for it.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => match serde_json::to_string(&init) {
                    Ok(json) => {
                        let _ = signals.send(TransportSignal::LocalCandidate(json));
                    }
                    Err(error) => warn!(event = "candidate_serialize_failed", %error),
                },
                Err(error) => warn!(event = "candidate_to_json_failed", %error),
            }
        })
    }));
}

fn wire_connection_state(
    pc: &Arc<RTCPeerConnection>,
    signals: mpsc::UnboundedSender<TransportSignal>,
) {
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let signals = signals.clone();
        Box::pin(async move {
            debug!(event = "peer_connection_state", %state);
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
            ) {
                let _ = signals.send(TransportSignal::Failed(format!(
                    "peer connection {state}"
                )));
            }
        })
    }));
}

fn attach_channel_handlers(
    dc: &Arc<RTCDataChannel>,
    signals: mpsc::UnboundedSender<TransportSignal>,
) {
    {
        let dc = dc.clone();
        let signals = signals.clone();
        let dc_open = dc.clone();
        dc.on_open(Box::new(move || {
            let signals = signals.clone();
            let dc = dc_open.clone();
            Box::pin(async move {
                debug!(event = "data_channel_open", label = %dc.label());
                let channel: Arc<dyn TransferChannel> = Arc::new(RtcChannel { dc });
                let _ = signals.send(TransportSignal::ChannelOpen(channel));
            })
        }));
    }

    {
        let signals = signals.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let signals = signals.clone();
            Box::pin(async move {
                let payload = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelPayload::Text(text),
                        Err(error) => {
                            warn!(event = "channel_text_invalid_utf8", %error);
                            return;
                        }
                    }
                } else {
                    ChannelPayload::Binary(msg.data)
                };
                let _ = signals.send(TransportSignal::ChannelMessage(payload));
            })
        }));
    }

    dc.on_close(Box::new(move || {
        let signals = signals.clone();
        Box::pin(async move {
            let _ = signals.send(TransportSignal::ChannelClosed);
        })
    }));
}
