//! Mesh bookkeeping: one peer connection per other room participant.
//!
//! Offer direction is fixed: the joiner offers to everyone it finds in
//! `room-joined`, existing members simply wait for the new peer's
//! offer. `participant-joined` therefore triggers no local action.
//!
//! Local media tracks are attached to each peer connection when it is
//! created, whatever tracks exist at that moment; a track acquired
//! later is not renegotiated onto existing connections.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::track::track_remote::TrackRemote;

use crate::media::MediaTracks;
use crate::session::candidates::CandidateBuffer;
use crate::session::transport::{
    PeerTransport, TransportFactory, TransportMode, TransportSignal,
};

use super::{RoomEnvelope, RoomEvent, RoomSocket, RoomSubscription};

// ── Public surface ───────────────────────────────────────────────────────────

/// Room-level notifications for the application (rendering, roster UI).
pub enum RoomUpdate {
    RemoteTrackAdded {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
    PeerLeft {
        peer_id: String,
    },
}

impl std::fmt::Debug for RoomUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RemoteTrackAdded { peer_id, .. } => {
                f.debug_struct("RemoteTrackAdded").field("peer_id", peer_id).finish()
            }
            Self::PeerLeft { peer_id } => {
                f.debug_struct("PeerLeft").field("peer_id", peer_id).finish()
            }
        }
    }
}

/// Owner's handle to a joined room. Dropping it leaves the room.
pub struct RoomHandle {
    pub updates: mpsc::UnboundedReceiver<RoomUpdate>,
    leave_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    /// Close every peer connection and the socket. Idempotent.
    pub fn leave(&self) {
        let _ = self.leave_tx.send(());
    }

    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

/// Join a room: spawn the registry task over an already established
/// socket subscription.
pub fn join_room(
    socket: Arc<dyn RoomSocket>,
    subscription: RoomSubscription,
    factory: Arc<dyn TransportFactory>,
    tracks: MediaTracks,
) -> RoomHandle {
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (leave_tx, leave_rx) = mpsc::unbounded_channel();
    let (peer_signals_tx, peer_signals_rx) = mpsc::unbounded_channel();

    info!(event = "room_join", local_id = %subscription.local_id);

    let mut registry = PeerRegistry {
        local_id: subscription.local_id,
        socket,
        factory,
        tracks,
        peers: HashMap::new(),
        updates: updates_tx,
        peer_signals_tx,
    };
    let mut envelopes = subscription.envelopes;
    let mut peer_signals = peer_signals_rx;
    let mut leave_rx = leave_rx;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                envelope = envelopes.recv() => match envelope {
                    Some(envelope) => registry.on_envelope(envelope).await,
                    None => break,
                },
                signal = peer_signals.recv() => {
                    if let Some((peer_id, signal)) = signal {
                        registry.on_peer_signal(peer_id, signal).await;
                    }
                },
                _ = leave_rx.recv() => break,
            }
        }
        registry.shutdown().await;
    });

    RoomHandle {
        updates: updates_rx,
        leave_tx,
        task,
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

struct RoomPeer {
    transport: Arc<dyn PeerTransport>,
    candidates: CandidateBuffer,
    /// Remote description applied; candidates go straight through.
    remote_described: bool,
    /// We sent an offer and have not yet seen its answer. Mirrors the
    /// browser's `have-local-offer` signaling-state guard.
    awaiting_answer: bool,
    forwarder: JoinHandle<()>,
}

struct PeerRegistry {
    local_id: String,
    socket: Arc<dyn RoomSocket>,
    factory: Arc<dyn TransportFactory>,
    tracks: MediaTracks,
    peers: HashMap<String, RoomPeer>,
    updates: mpsc::UnboundedSender<RoomUpdate>,
    /// Fan-in of every peer transport's signal stream, tagged by peer.
    peer_signals_tx: mpsc::UnboundedSender<(String, TransportSignal)>,
}

impl PeerRegistry {
    async fn on_envelope(&mut self, envelope: RoomEnvelope) {
        match envelope.event {
            RoomEvent::RoomJoined { participants } => self.on_room_joined(participants).await,
            RoomEvent::ParticipantJoined { joined_id } => {
                // The joiner offers to us; nothing to initiate here.
                debug!(event = "participant_joined", peer = %joined_id);
            }
            RoomEvent::ParticipantLeft { left_id } => self.remove_peer(&left_id).await,
            RoomEvent::WebrtcOffer { payload, .. } => {
                let Some(sender) = envelope.sender_id else {
                    warn!(event = "offer_without_sender");
                    return;
                };
                self.on_offer(sender, payload).await;
            }
            RoomEvent::WebrtcAnswer { payload, .. } => {
                let Some(sender) = envelope.sender_id else {
                    warn!(event = "answer_without_sender");
                    return;
                };
                self.on_answer(sender, payload).await;
            }
            RoomEvent::IceCandidate { payload, .. } => {
                let Some(sender) = envelope.sender_id else {
                    warn!(event = "candidate_without_sender");
                    return;
                };
                self.on_candidate(sender, payload).await;
            }
        }
    }

    /// Joiner's fan-out: offer to every existing participant.
    async fn on_room_joined(&mut self, participants: Vec<String>) {
        info!(
            event = "room_joined",
            local_id = %self.local_id,
            participants = participants.len(),
        );
        for peer_id in participants {
            if peer_id == self.local_id {
                continue;
            }
            if let Err(error) = self.offer_to(&peer_id).await {
                warn!(event = "room_offer_failed", peer = %peer_id, error = %format!("{error:#}"));
                // A peer left half-built would silently swallow its
                // answer and buffer candidates forever.
                self.remove_peer(&peer_id).await;
            }
        }
    }

    async fn offer_to(&mut self, peer_id: &str) -> Result<()> {
        let transport = self.create_peer_transport(peer_id).await?;
        let offer = transport.create_offer().await?;
        self.socket
            .send(RoomEvent::WebrtcOffer {
                target_id: peer_id.to_string(),
                payload: serde_json::from_str(&offer)?,
            })
            .await?;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.awaiting_answer = true;
        }
        debug!(event = "room_offer_sent", peer = %peer_id);
        Ok(())
    }

    async fn on_offer(&mut self, sender: String, payload: serde_json::Value) {
        let transport = if let Some(peer) = self.peers.get(&sender) {
            Ok(peer.transport.clone())
        } else {
            self.create_peer_transport(&sender).await
        };

        let socket = self.socket.clone();
        let result: Result<()> = async {
            let transport = transport?;
            let offer = serde_json::to_string(&payload)?;
            let answer = transport.apply_offer_and_answer(&offer).await?;
            socket
                .send(RoomEvent::WebrtcAnswer {
                    target_id: sender.clone(),
                    payload: serde_json::from_str(&answer)?,
                })
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!(event = "room_answer_sent", peer = %sender);
                if let Some(peer) = self.peers.get_mut(&sender) {
                    peer.remote_described = true;
                }
                self.drain_candidates(&sender).await;
            }
            Err(error) => {
                warn!(event = "room_offer_handling_failed", peer = %sender, error = %format!("{error:#}"));
                self.remove_peer(&sender).await;
            }
        }
    }

    async fn on_answer(&mut self, sender: String, payload: serde_json::Value) {
        let transport = match self.peers.get(&sender) {
            Some(peer) if peer.awaiting_answer => peer.transport.clone(),
            Some(_) => {
                // Duplicate or unsolicited answer; applying it would
                // corrupt the signaling state.
                warn!(event = "answer_ignored", peer = %sender);
                return;
            }
            None => {
                warn!(event = "answer_from_unknown_peer", peer = %sender);
                return;
            }
        };

        let result: Result<()> = async {
            let answer = serde_json::to_string(&payload)?;
            transport.apply_answer(&answer).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                if let Some(peer) = self.peers.get_mut(&sender) {
                    peer.awaiting_answer = false;
                    peer.remote_described = true;
                }
                self.drain_candidates(&sender).await;
            }
            Err(error) => {
                warn!(event = "room_answer_rejected", peer = %sender, %error);
                self.remove_peer(&sender).await;
            }
        }
    }

    async fn on_candidate(&mut self, sender: String, payload: serde_json::Value) {
        let candidate = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(error) => {
                warn!(event = "room_candidate_invalid", %error);
                return;
            }
        };
        let Some(peer) = self.peers.get_mut(&sender) else {
            warn!(event = "candidate_for_unknown_peer", peer = %sender);
            return;
        };
        if peer.remote_described {
            if let Err(error) = peer.transport.apply_candidate(&candidate).await {
                warn!(event = "room_candidate_rejected", peer = %sender, %error);
            }
        } else {
            peer.candidates.push(candidate);
        }
    }

    async fn drain_candidates(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        for candidate in peer.candidates.drain() {
            if let Err(error) = peer.transport.apply_candidate(&candidate).await {
                warn!(event = "room_candidate_rejected", peer = %peer_id, %error);
            }
        }
    }

    /// Build a media transport for `peer_id` with the local tracks
    /// attached, and a forwarder tagging its signals with the peer id.
    async fn create_peer_transport(&mut self, peer_id: &str) -> Result<Arc<dyn PeerTransport>> {
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let transport = self
            .factory
            .create(
                TransportMode::Media,
                signals_tx,
                Some(self.tracks.clone()),
            )
            .await?;

        let fan_in = self.peer_signals_tx.clone();
        let id = peer_id.to_string();
        let forwarder = tokio::spawn(async move {
            while let Some(signal) = signals_rx.recv().await {
                if fan_in.send((id.clone(), signal)).is_err() {
                    break;
                }
            }
        });

        self.peers.insert(
            peer_id.to_string(),
            RoomPeer {
                transport: transport.clone(),
                candidates: CandidateBuffer::new(),
                remote_described: false,
                awaiting_answer: false,
                forwarder,
            },
        );
        Ok(transport)
    }

    async fn on_peer_signal(&mut self, peer_id: String, signal: TransportSignal) {
        match signal {
            TransportSignal::LocalCandidate(candidate) => {
                let payload = match serde_json::from_str(&candidate) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(event = "room_local_candidate_malformed", %error);
                        return;
                    }
                };
                if let Err(error) = self
                    .socket
                    .send(RoomEvent::IceCandidate {
                        target_id: peer_id.clone(),
                        payload,
                    })
                    .await
                {
                    warn!(event = "room_candidate_send_failed", peer = %peer_id, %error);
                }
            }
            TransportSignal::RemoteTrack(track) => {
                debug!(event = "room_remote_track", peer = %peer_id, kind = %track.kind());
                let _ = self.updates.send(RoomUpdate::RemoteTrackAdded { peer_id, track });
            }
            TransportSignal::Failed(reason) => {
                warn!(event = "room_peer_failed", peer = %peer_id, reason);
                self.remove_peer(&peer_id).await;
            }
            // Data channels are not part of room sessions.
            TransportSignal::ChannelOpen(_)
            | TransportSignal::ChannelMessage(_)
            | TransportSignal::ChannelClosed => {
                debug!(event = "room_unexpected_channel_signal", peer = %peer_id);
            }
        }
    }

    /// Close a peer's connection and drop its remote media.
    async fn remove_peer(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };
        info!(event = "room_peer_removed", peer = %peer_id);
        peer.forwarder.abort();
        if let Err(error) = peer.transport.close().await {
            warn!(event = "room_peer_close_failed", peer = %peer_id, %error);
        }
        let _ = self.updates.send(RoomUpdate::PeerLeft {
            peer_id: peer_id.to_string(),
        });
    }

    async fn shutdown(&mut self) {
        info!(event = "room_leave", local_id = %self.local_id, peers = self.peers.len());
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.remove_peer(&peer_id).await;
        }
        self.socket.leave().await;
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeSocket {
        sent: Mutex<Vec<RoomEvent>>,
        left: AtomicBool,
    }

    impl FakeSocket {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                left: AtomicBool::new(false),
            })
        }

        fn sent(&self) -> Vec<RoomEvent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RoomSocket for FakeSocket {
        async fn send(&self, event: RoomEvent) -> Result<()> {
            self.sent.lock().unwrap().push(event);
            Ok(())
        }

        async fn leave(&self) {
            self.left.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
        fail_offer: bool,
    }

    struct FakeTransport {
        log: Arc<Mutex<Vec<String>>>,
        fail_offer: bool,
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn create(
            &self,
            mode: TransportMode,
            _signals: mpsc::UnboundedSender<TransportSignal>,
            tracks: Option<MediaTracks>,
        ) -> Result<Arc<dyn PeerTransport>> {
            if self.fail {
                return Err(anyhow!("scripted create failure"));
            }
            assert_eq!(mode, TransportMode::Media);
            assert!(tracks.is_some());
            self.log.lock().unwrap().push("create".into());
            Ok(Arc::new(FakeTransport {
                log: self.log.clone(),
                fail_offer: self.fail_offer,
            }))
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn create_offer(&self) -> Result<String> {
            if self.fail_offer {
                return Err(anyhow!("scripted offer failure"));
            }
            self.log.lock().unwrap().push("create_offer".into());
            Ok(r#"{"type":"offer"}"#.into())
        }

        async fn apply_offer_and_answer(&self, _offer: &str) -> Result<String> {
            self.log.lock().unwrap().push("apply_offer".into());
            Ok(r#"{"type":"answer"}"#.into())
        }

        async fn apply_answer(&self, _answer: &str) -> Result<()> {
            self.log.lock().unwrap().push("apply_answer".into());
            Ok(())
        }

        async fn apply_candidate(&self, candidate: &str) -> Result<()> {
            let parsed: serde_json::Value = serde_json::from_str(candidate)?;
            self.log
                .lock()
                .unwrap()
                .push(format!("candidate:{}", parsed["candidate"].as_str().unwrap()));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.log.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    fn empty_tracks() -> MediaTracks {
        MediaTracks {
            audio: None,
            video: None,
        }
    }

    fn envelope(event: RoomEvent, sender: Option<&str>) -> RoomEnvelope {
        RoomEnvelope {
            event,
            sender_id: sender.map(String::from),
        }
    }

    struct TestRoom {
        socket: Arc<FakeSocket>,
        factory: Arc<FakeFactory>,
        envelopes: mpsc::UnboundedSender<RoomEnvelope>,
        handle: RoomHandle,
    }

    fn start_room(local_id: &str) -> TestRoom {
        let socket = FakeSocket::new();
        let factory = Arc::new(FakeFactory::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = join_room(
            socket.clone(),
            RoomSubscription {
                local_id: local_id.into(),
                envelopes: rx,
            },
            factory.clone(),
            empty_tracks(),
        );
        TestRoom {
            socket,
            factory,
            envelopes: tx,
            handle,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn joiner_offers_to_everyone_but_itself() {
        let room = start_room("me");

        room.envelopes
            .send(envelope(
                RoomEvent::RoomJoined {
                    participants: vec!["me".into(), "p1".into(), "p2".into()],
                },
                None,
            ))
            .unwrap();
        settle().await;

        let offers: Vec<String> = room
            .socket
            .sent()
            .into_iter()
            .filter_map(|e| match e {
                RoomEvent::WebrtcOffer { target_id, .. } => Some(target_id),
                _ => None,
            })
            .collect();
        assert_eq!(offers, ["p1", "p2"]);
    }

    #[tokio::test]
    async fn existing_member_does_not_offer_on_participant_joined() {
        let room = start_room("me");

        room.envelopes
            .send(envelope(
                RoomEvent::ParticipantJoined {
                    joined_id: "newcomer".into(),
                },
                None,
            ))
            .unwrap();
        settle().await;

        assert!(room.socket.sent().is_empty());
        assert!(room.factory.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn incoming_offer_gets_an_answer_back_to_the_sender() {
        let room = start_room("me");

        room.envelopes
            .send(envelope(
                RoomEvent::WebrtcOffer {
                    target_id: "me".into(),
                    payload: serde_json::json!({"type": "offer"}),
                },
                Some("p1"),
            ))
            .unwrap();
        settle().await;

        let sent = room.socket.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            RoomEvent::WebrtcAnswer { target_id, .. } if target_id == "p1"
        ));
    }

    #[tokio::test]
    async fn unsolicited_answer_is_ignored() {
        let room = start_room("me");

        // Answer from a peer we never offered to.
        room.envelopes
            .send(envelope(
                RoomEvent::WebrtcAnswer {
                    target_id: "me".into(),
                    payload: serde_json::json!({"type": "answer"}),
                },
                Some("stranger"),
            ))
            .unwrap();
        settle().await;
        assert!(room.factory.log.lock().unwrap().is_empty());

        // And a second answer after a legitimate one.
        room.envelopes
            .send(envelope(
                RoomEvent::RoomJoined {
                    participants: vec!["me".into(), "p1".into()],
                },
                None,
            ))
            .unwrap();
        for _ in 0..2 {
            room.envelopes
                .send(envelope(
                    RoomEvent::WebrtcAnswer {
                        target_id: "me".into(),
                        payload: serde_json::json!({"type": "answer"}),
                    },
                    Some("p1"),
                ))
                .unwrap();
        }
        settle().await;

        let applied = room
            .factory
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| *l == "apply_answer")
            .count();
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn candidates_buffer_until_the_answer_arrives() {
        let room = start_room("me");

        room.envelopes
            .send(envelope(
                RoomEvent::RoomJoined {
                    participants: vec!["me".into(), "p1".into()],
                },
                None,
            ))
            .unwrap();
        room.envelopes
            .send(envelope(
                RoomEvent::IceCandidate {
                    target_id: "me".into(),
                    payload: serde_json::json!({"candidate": "c0"}),
                },
                Some("p1"),
            ))
            .unwrap();
        settle().await;
        assert!(!room
            .factory
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|l| l.starts_with("candidate:")));

        room.envelopes
            .send(envelope(
                RoomEvent::WebrtcAnswer {
                    target_id: "me".into(),
                    payload: serde_json::json!({"type": "answer"}),
                },
                Some("p1"),
            ))
            .unwrap();
        settle().await;

        let log = room.factory.log.lock().unwrap().clone();
        assert!(log.contains(&"candidate:c0".to_string()));
    }

    #[tokio::test]
    async fn participant_left_closes_and_reports() {
        let mut room = start_room("me");

        room.envelopes
            .send(envelope(
                RoomEvent::RoomJoined {
                    participants: vec!["me".into(), "p1".into()],
                },
                None,
            ))
            .unwrap();
        room.envelopes
            .send(envelope(
                RoomEvent::ParticipantLeft {
                    left_id: "p1".into(),
                },
                None,
            ))
            .unwrap();
        settle().await;

        assert!(room
            .factory
            .log
            .lock()
            .unwrap()
            .contains(&"close".to_string()));
        let update = room.handle.updates.recv().await.unwrap();
        assert!(matches!(update, RoomUpdate::PeerLeft { peer_id } if peer_id == "p1"));

        // A candidate for the removed peer is dropped, not applied.
        let before = room.factory.log.lock().unwrap().len();
        room.envelopes
            .send(envelope(
                RoomEvent::IceCandidate {
                    target_id: "me".into(),
                    payload: serde_json::json!({"candidate": "late"}),
                },
                Some("p1"),
            ))
            .unwrap();
        settle().await;
        assert_eq!(room.factory.log.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn failed_offer_does_not_leave_a_half_built_peer() {
        let socket = FakeSocket::new();
        let factory = Arc::new(FakeFactory {
            fail_offer: true,
            ..Default::default()
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handle = join_room(
            socket.clone(),
            RoomSubscription {
                local_id: "me".into(),
                envelopes: rx,
            },
            factory.clone(),
            empty_tracks(),
        );

        tx.send(envelope(
            RoomEvent::RoomJoined {
                participants: vec!["me".into(), "p1".into()],
            },
            None,
        ))
        .unwrap();
        settle().await;

        // The broken peer was torn down, not left in the map.
        assert!(matches!(
            handle.updates.recv().await.unwrap(),
            RoomUpdate::PeerLeft { peer_id } if peer_id == "p1"
        ));
        assert!(factory.log.lock().unwrap().contains(&"close".to_string()));

        // A late answer or candidate from that peer is dropped instead
        // of feeding a connection that never sent its offer.
        tx.send(envelope(
            RoomEvent::WebrtcAnswer {
                target_id: "me".into(),
                payload: serde_json::json!({"type": "answer"}),
            },
            Some("p1"),
        ))
        .unwrap();
        tx.send(envelope(
            RoomEvent::IceCandidate {
                target_id: "me".into(),
                payload: serde_json::json!({"candidate": "c0"}),
            },
            Some("p1"),
        ))
        .unwrap();
        settle().await;

        let log = factory.log.lock().unwrap().clone();
        assert!(!log.contains(&"apply_answer".to_string()));
        assert!(!log.iter().any(|l| l.starts_with("candidate:")));
    }

    #[tokio::test]
    async fn leave_closes_every_peer_and_the_socket() {
        let room = start_room("me");

        room.envelopes
            .send(envelope(
                RoomEvent::RoomJoined {
                    participants: vec!["me".into(), "p1".into(), "p2".into()],
                },
                None,
            ))
            .unwrap();
        settle().await;

        room.handle.leave();
        room.handle.finished().await;

        let closes = room
            .factory
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|l| *l == "close")
            .count();
        assert_eq!(closes, 2);
        assert!(room.socket.left.load(Ordering::SeqCst));
    }
}
