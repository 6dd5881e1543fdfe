//! Call Module - Verhandlung und Peer-Connection
//!
//! Dieses Modul enthält:
//! - den CallOrchestrator (Offer/Answer-Ablauf über den Relay-Bus)
//! - CallSession mit expliziter Verhandlungs-State-Machine
//! - die PeerLink-Abstraktion samt webrtc-rs-Implementierung

mod orchestrator;
mod peer;
mod session;

pub use orchestrator::{
    AcceptAll, BusError, CallError, CallEvent, CallOrchestrator, CallRequest, ConsentPolicy,
    SignalBus,
};
pub use peer::{LinkFactory, PeerError, PeerLink, WebRtcLink, WebRtcLinkFactory};
pub use session::{
    CallMode, CallRole, CallSession, DescriptionKind, NegotiationPhase, ParticipantId, PhaseError,
    SessionDescription,
};
