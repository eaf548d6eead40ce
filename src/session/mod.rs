//! Point-to-point transfer sessions: codes, negotiation, transport.

pub mod candidates;
pub mod code;
pub mod expiry;
pub mod negotiator;
pub mod rtc;
pub mod transport;

pub use candidates::CandidateBuffer;
pub use code::SessionCode;
pub use expiry::ExpiryController;
pub use negotiator::{
    start_initiator, start_initiator_with_expiry, start_responder, SessionEvent, SessionHandle,
    SessionRole, SessionState,
};
pub use rtc::RtcTransportFactory;
pub use transport::{
    ChannelPayload, PeerTransport, TransportFactory, TransportMode, TransportSignal,
};
