//! ZippySend: peer-to-peer file drop and A/V rooms over WebRTC.
//!
//! Two browsers (or headless peers) exchange files directly over an
//! ordered, reliable data channel after pairing through a short session
//! code; several peers can instead share audio/video in a full-mesh
//! room. A pub/sub signaling relay carries only the negotiation frames
//! (`ready`/`offer`/`answer`/`ice-candidate`) — file bytes and media
//! never touch it.
//!
//! # Point-to-point transfer
//!
//! ```no_run
//! use std::sync::Arc;
//! use zippysend::session::{self, RtcTransportFactory, SessionCode, SessionEvent};
//! use zippysend::signaling::RelayBus;
//! use zippysend::transfer::sender::{send_files, OutgoingFile, SenderConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let bus = RelayBus::new();
//! let relay = Arc::new(bus.client());
//! let factory = Arc::new(RtcTransportFactory::new());
//!
//! let code = SessionCode::generate();
//! println!("share this code: {code}");
//! let mut session = session::start_initiator(relay, factory, code).await?;
//!
//! while let Some(event) = session.events.recv().await {
//!     if let SessionEvent::Open(channel) = event {
//!         let file = OutgoingFile::from_path("photo.jpg").await?;
//!         send_files(channel.as_ref(), &[file], &SenderConfig::default(), None).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The responder mirrors this with [`session::start_responder`] and a
//! code parsed from user input; received files arrive as
//! [`SessionEvent::Transfer`] events.

pub mod config;
pub mod media;
pub mod room;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use session::{SessionCode, SessionEvent, SessionHandle, SessionState};
pub use transfer::TransferEvent;
