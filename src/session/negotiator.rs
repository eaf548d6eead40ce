//! Point-to-point session negotiation.
//!
//! One spawned task owns each session outright: relay frames, transport
//! signals and caller commands are funneled into a single `select` loop
//! and every handler runs to completion before the next input is
//! dispatched. There is no shared mutable negotiation state and no
//! global session registry; a [`SessionHandle`] is the only way in.
//!
//! The state machine:
//!
//! ```text
//! New ─(ready)→ Offering ─(answer)→ Negotiating ─(channel open)→ Open
//! New ─(offer)→ AwaitingOffer path: responder answers → Negotiating → Open
//! any ─(close | expiry | channel closed)→ Closed
//! any ─(transport failure)→ Failed
//! ```
//!
//! `Closed` and `Failed` are terminal; there is no retry. A peer that
//! wants another go starts a fresh session with a fresh code.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SESSION_EXPIRY;
use crate::signaling::{RelaySubscription, SignalFrame, SignalKind, SignalingRelay};
use crate::transfer::receiver::IncomingFiles;
use crate::transfer::{TransferChannel, TransferEvent};

use super::candidates::CandidateBuffer;
use super::code::SessionCode;
use super::expiry::ExpiryController;
use super::transport::{
    ChannelPayload, PeerTransport, TransportFactory, TransportMode, TransportSignal,
};

// ── Public surface ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Generated the code; will create the data channel and the offer.
    Initiator,
    /// Entered the code; announces `ready` and answers the offer.
    Responder,
}

/// Observable session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    /// Initiator: offer published, waiting for the answer.
    Offering,
    /// Responder: `ready` published, waiting for the offer.
    AwaitingOffer,
    /// Remote description set; ICE running, channel not open yet.
    Negotiating,
    Open,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether a remote description has been applied, i.e. whether
    /// remote candidates can be applied directly instead of buffered.
    fn remote_described(self) -> bool {
        matches!(self, SessionState::Negotiating | SessionState::Open)
    }
}

/// Outcomes and payloads surfaced to the session's owner.
pub enum SessionEvent {
    /// The data channel opened; use it with the transfer sender.
    Open(Arc<dyn TransferChannel>),
    /// Progress from the receive side of the transfer protocol.
    Transfer(TransferEvent),
    /// The unanswered session hit its expiry deadline and was closed.
    Expired,
    /// Transport failure; the session is in the `Failed` terminal state.
    Failed(String),
    Closed,
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(ch) => f.debug_tuple("Open").field(&ch.label()).finish(),
            Self::Transfer(ev) => f.debug_tuple("Transfer").field(ev).finish(),
            Self::Expired => f.write_str("Expired"),
            Self::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
            Self::Closed => f.write_str("Closed"),
        }
    }
}

/// Caller-facing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Close,
}

/// Owner's handle to a running session task.
///
/// Dropping the handle closes the session. `close` is idempotent: once
/// the task has reached a terminal state further commands are silently
/// discarded.
pub struct SessionHandle {
    code: SessionCode,
    commands: mpsc::UnboundedSender<SessionCommand>,
    pub state: watch::Receiver<SessionState>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    /// Wait for the session task to finish (it exits at any terminal
    /// state).
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

// ── Entry points ─────────────────────────────────────────────────────────────

/// Start the initiating side of a session: subscribe to the code's
/// channel and wait for the responder's `ready`. The expiry countdown
/// starts immediately.
pub async fn start_initiator(
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    code: SessionCode,
) -> Result<SessionHandle> {
    start_initiator_with_expiry(relay, factory, code, SESSION_EXPIRY).await
}

/// [`start_initiator`] with an explicit expiry deadline.
pub async fn start_initiator_with_expiry(
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    code: SessionCode,
    expiry: Duration,
) -> Result<SessionHandle> {
    start(relay, factory, code, SessionRole::Initiator, Some(expiry)).await
}

/// Start the responding side: subscribe and immediately publish `ready`
/// so the initiator knows both ends are listening. No expiry countdown;
/// the initiator owns the session's lifetime.
pub async fn start_responder(
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    code: SessionCode,
) -> Result<SessionHandle> {
    start(relay, factory, code, SessionRole::Responder, None).await
}

async fn start(
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    code: SessionCode,
    role: SessionRole,
    expiry: Option<Duration>,
) -> Result<SessionHandle> {
    let channel = code.channel_name();
    let subscription = relay.subscribe(&channel).await?;

    if role == SessionRole::Responder {
        relay.publish(&channel, SignalFrame::ready()).await?;
    }

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
    // The expiry timer gets its own channel: the handle must hold the
    // only command sender so dropping it ends the command stream and
    // closes the session.
    let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
    let initial = if role == SessionRole::Responder {
        SessionState::AwaitingOffer
    } else {
        SessionState::New
    };
    let (state_tx, state_rx) = watch::channel(initial);

    let expiry = match expiry {
        Some(deadline) => {
            let tx = expiry_tx.clone();
            ExpiryController::arm(deadline, move || {
                let _ = tx.send(());
            })
        }
        None => ExpiryController::disarmed(),
    };

    info!(
        event = "session_start",
        code = %code,
        ?role,
        channel = %channel,
    );

    let mut session = SessionLoop {
        code: code.clone(),
        role,
        channel,
        relay,
        factory,
        subscription,
        commands_rx,
        signals_tx,
        signals_rx,
        transfer_rx,
        _expiry_tx: expiry_tx,
        expiry_rx,
        state_tx,
        events: events_tx,
        expiry,
        transport: None,
        candidates: CandidateBuffer::new(),
        incoming: IncomingFiles::new(Some(transfer_tx)),
    };
    let task = tokio::spawn(async move { session.run().await });

    Ok(SessionHandle {
        code,
        commands: commands_tx,
        state: state_rx,
        events: events_rx,
        task,
    })
}

// ── Session loop ─────────────────────────────────────────────────────────────

struct SessionLoop {
    code: SessionCode,
    role: SessionRole,
    channel: String,
    relay: Arc<dyn SignalingRelay>,
    factory: Arc<dyn TransportFactory>,
    subscription: RelaySubscription,
    commands_rx: mpsc::UnboundedReceiver<SessionCommand>,
    // The loop keeps its own senders so these streams never end while
    // the loop is alive; only the handle's command sender may close.
    signals_tx: mpsc::UnboundedSender<TransportSignal>,
    signals_rx: mpsc::UnboundedReceiver<TransportSignal>,
    transfer_rx: mpsc::UnboundedReceiver<TransferEvent>,
    _expiry_tx: mpsc::UnboundedSender<()>,
    expiry_rx: mpsc::UnboundedReceiver<()>,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    expiry: ExpiryController,
    transport: Option<Arc<dyn PeerTransport>>,
    candidates: CandidateBuffer,
    incoming: IncomingFiles,
}

impl SessionLoop {
    async fn run(&mut self) {
        while !self.state().is_terminal() {
            tokio::select! {
                frame = self.subscription.frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => self.fail("relay subscription ended").await,
                },
                signal = self.signals_rx.recv() => {
                    if let Some(signal) = signal {
                        self.on_signal(signal).await;
                    }
                },
                command = self.commands_rx.recv() => match command {
                    // `None` means the handle was dropped; treat it as
                    // an explicit close.
                    Some(SessionCommand::Close) | None => self.close_session().await,
                },
                _ = self.expiry_rx.recv() => self.expire().await,
                transfer = self.transfer_rx.recv() => {
                    if let Some(event) = transfer {
                        let _ = self.events.send(SessionEvent::Transfer(event));
                    }
                },
            }
        }
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state();
        if prev != next {
            debug!(event = "session_state", code = %self.code, ?prev, ?next);
            let _ = self.state_tx.send(next);
        }
    }

    // ── Relay frames ─────────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: SignalFrame) {
        match frame.event {
            SignalKind::Ready => self.on_ready().await,
            SignalKind::Offer => self.on_offer(frame).await,
            SignalKind::Answer => self.on_answer(frame).await,
            SignalKind::IceCandidate => self.on_remote_candidate(frame).await,
        }
    }

    async fn on_ready(&mut self) {
        if self.role != SessionRole::Initiator || self.state() != SessionState::New {
            debug!(event = "ready_ignored", code = %self.code, state = ?self.state());
            return;
        }

        let result: Result<()> = async {
            let transport = self
                .factory
                .create(TransportMode::DataInitiator, self.signals_tx.clone(), None)
                .await?;
            let offer = transport.create_offer().await?;
            let payload: serde_json::Value = serde_json::from_str(&offer)?;
            self.relay
                .publish(&self.channel, SignalFrame::offer(payload))
                .await?;
            self.transport = Some(transport);
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(event = "offer_published", code = %self.code);
                self.set_state(SessionState::Offering);
            }
            Err(error) => self.fail(&format!("offer setup failed: {error:#}")).await,
        }
    }

    async fn on_offer(&mut self, frame: SignalFrame) {
        if self.role != SessionRole::Responder || self.state() != SessionState::AwaitingOffer {
            debug!(event = "offer_ignored", code = %self.code, state = ?self.state());
            return;
        }

        let result: Result<()> = async {
            let transport = self
                .factory
                .create(TransportMode::DataResponder, self.signals_tx.clone(), None)
                .await?;
            let offer = serde_json::to_string(&frame.payload)?;
            let answer = transport.apply_offer_and_answer(&offer).await?;
            let payload: serde_json::Value = serde_json::from_str(&answer)?;
            self.relay
                .publish(&self.channel, SignalFrame::answer(payload))
                .await?;
            self.transport = Some(transport);
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(event = "answer_published", code = %self.code);
                self.set_state(SessionState::Negotiating);
                self.drain_candidates().await;
            }
            Err(error) => self.fail(&format!("answer setup failed: {error:#}")).await,
        }
    }

    async fn on_answer(&mut self, frame: SignalFrame) {
        if self.state() != SessionState::Offering {
            debug!(event = "answer_ignored", code = %self.code, state = ?self.state());
            return;
        }
        let Some(transport) = self.transport.clone() else {
            return;
        };

        let result: Result<()> = async {
            let answer = serde_json::to_string(&frame.payload)?;
            transport.apply_answer(&answer).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(SessionState::Negotiating);
                self.drain_candidates().await;
            }
            Err(error) => self.fail(&format!("answer rejected: {error:#}")).await,
        }
    }

    async fn on_remote_candidate(&mut self, frame: SignalFrame) {
        let candidate = match serde_json::to_string(&frame.payload) {
            Ok(json) => json,
            Err(error) => {
                warn!(event = "candidate_payload_invalid", %error);
                return;
            }
        };

        if self.state().remote_described() {
            self.apply_candidate(candidate).await;
        } else {
            debug!(
                event = "candidate_buffered",
                code = %self.code,
                pending = self.candidates.len() + 1,
            );
            self.candidates.push(candidate);
        }
    }

    /// Apply everything buffered, in arrival order. Runs exactly once
    /// per session, on the transition into `Negotiating`.
    async fn drain_candidates(&mut self) {
        let pending = self.candidates.drain();
        if pending.is_empty() {
            return;
        }
        debug!(event = "candidates_drained", code = %self.code, count = pending.len());
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: String) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        // A bad candidate is not fatal; ICE keeps working on the rest.
        if let Err(error) = transport.apply_candidate(&candidate).await {
            warn!(event = "candidate_rejected", code = %self.code, %error);
        }
    }

    // ── Transport signals ────────────────────────────────────────────────

    async fn on_signal(&mut self, signal: TransportSignal) {
        match signal {
            TransportSignal::LocalCandidate(candidate) => {
                match serde_json::from_str(&candidate) {
                    Ok(payload) => {
                        if let Err(error) = self
                            .relay
                            .publish(&self.channel, SignalFrame::ice_candidate(payload))
                            .await
                        {
                            warn!(event = "candidate_publish_failed", code = %self.code, %error);
                        }
                    }
                    Err(error) => warn!(event = "candidate_malformed", %error),
                }
            }
            TransportSignal::ChannelOpen(channel) => {
                info!(event = "session_open", code = %self.code, label = %channel.label());
                // An established session is never expired.
                self.expiry.disarm();
                self.set_state(SessionState::Open);
                let _ = self.events.send(SessionEvent::Open(channel));
            }
            TransportSignal::ChannelMessage(payload) => {
                let result = match payload {
                    ChannelPayload::Text(text) => self.incoming.handle_text(&text),
                    ChannelPayload::Binary(data) => self.incoming.handle_binary(&data),
                };
                if let Err(error) = result {
                    warn!(event = "channel_message_error", code = %self.code, %error);
                }
            }
            TransportSignal::ChannelClosed => {
                info!(event = "channel_closed", code = %self.code);
                self.close_session().await;
            }
            TransportSignal::RemoteTrack(_) => {
                // Media tracks belong to room sessions, not transfers.
                debug!(event = "unexpected_remote_track", code = %self.code);
            }
            TransportSignal::Failed(reason) => self.fail(&reason).await,
        }
    }

    // ── Terminal transitions ─────────────────────────────────────────────

    async fn close_session(&mut self) {
        if self.state().is_terminal() {
            return;
        }
        info!(event = "session_closed", code = %self.code);
        self.teardown().await;
        self.set_state(SessionState::Closed);
        let _ = self.events.send(SessionEvent::Closed);
    }

    async fn expire(&mut self) {
        if self.state().is_terminal() || self.state() == SessionState::Open {
            return;
        }
        info!(event = "session_expired", code = %self.code);
        self.teardown().await;
        self.set_state(SessionState::Closed);
        let _ = self.events.send(SessionEvent::Expired);
    }

    async fn fail(&mut self, reason: &str) {
        if self.state().is_terminal() {
            return;
        }
        warn!(event = "session_failed", code = %self.code, reason);
        self.teardown().await;
        self.set_state(SessionState::Failed);
        let _ = self.events.send(SessionEvent::Failed(reason.to_string()));
    }

    /// Release everything the session holds. Partial transfers are
    /// discarded outright; nothing is resumable.
    async fn teardown(&mut self) {
        self.expiry.disarm();
        self.candidates.clear();
        self.incoming.reset();
        if let Some(transport) = self.transport.take() {
            if let Err(error) = transport.close().await {
                warn!(event = "transport_close_failed", code = %self.code, %error);
            }
        }
        self.relay.unsubscribe(&self.channel).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
