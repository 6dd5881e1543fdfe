//! Call Session - Zustand eines einzelnen Anrufversuchs
//!
//! Eine CallSession ist ein Wert, der pro Anrufversuch frisch erstellt und
//! bei Abschluss, Fehler oder Ablehnung verworfen wird. Die Verhandlungs-
//! phase wird als explizite State-Machine geführt; ungültige Übergänge
//! sind typisierte Fehler.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::peer::PeerLink;

// ============================================================================
// PARTICIPANT ID
// ============================================================================

/// Opake Teilnehmer-ID, vom Relay pro verbundenem Client vergeben
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// SESSION DESCRIPTION
// ============================================================================

/// Format einer Session-Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Session-Description: Format plus SDP-Text
///
/// Nach dem Versand über das Relay gilt der Wert als unveränderlich.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

// ============================================================================
// CALL MODE / ROLE
// ============================================================================

/// Modus-Tag einer Verhandlung
///
/// Wird als Routing-Metadatum mitgeführt; die Gegenseite wendet das
/// benannte Video-Transform an.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    #[default]
    None,
    Rotate,
    Edges,
    Cartoon,
}

/// Rolle innerhalb einer Verhandlung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

// ============================================================================
// NEGOTIATION PHASE
// ============================================================================

/// Verhandlungsphase einer Session
///
/// Anrufer: `Idle → OfferCreated → LocalDescriptionSet → CandidatesGathered
/// → OfferSent → AnswerReceived → Connected`
///
/// Angerufener: `Idle → RemoteDescriptionSet → AnswerCreated →
/// LocalDescriptionSet → AnswerSent → Connected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    OfferCreated,
    LocalDescriptionSet,
    CandidatesGathered,
    OfferSent,
    AnswerReceived,
    RemoteDescriptionSet,
    AnswerCreated,
    AnswerSent,
    Connected,
}

impl NegotiationPhase {
    /// Prüft, ob `next` in der Rolle `role` direkt auf `self` folgen darf
    fn permits(self, next: NegotiationPhase, role: CallRole) -> bool {
        use NegotiationPhase::*;

        match role {
            CallRole::Caller => matches!(
                (self, next),
                (Idle, OfferCreated)
                    | (OfferCreated, LocalDescriptionSet)
                    | (LocalDescriptionSet, CandidatesGathered)
                    | (CandidatesGathered, OfferSent)
                    | (OfferSent, AnswerReceived)
                    | (AnswerReceived, Connected)
            ),
            CallRole::Callee => matches!(
                (self, next),
                (Idle, RemoteDescriptionSet)
                    | (RemoteDescriptionSet, AnswerCreated)
                    | (AnswerCreated, LocalDescriptionSet)
                    | (LocalDescriptionSet, AnswerSent)
                    | (AnswerSent, Connected)
            ),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid negotiation transition for {role:?}: {from:?} -> {to:?}")]
pub struct PhaseError {
    pub role: CallRole,
    pub from: NegotiationPhase,
    pub to: NegotiationPhase,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anrufversuch mit eigener Peer-Connection
pub struct CallSession {
    id: Uuid,
    peer: ParticipantId,
    role: CallRole,
    mode: CallMode,
    phase: NegotiationPhase,
    link: Arc<dyn PeerLink>,
}

impl CallSession {
    pub fn new(peer: ParticipantId, role: CallRole, mode: CallMode, link: Arc<dyn PeerLink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            role,
            mode,
            phase: NegotiationPhase::Idle,
            link,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn mode(&self) -> CallMode {
        self.mode
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn link(&self) -> Arc<dyn PeerLink> {
        Arc::clone(&self.link)
    }

    /// Gibt den Link auf und verbraucht die Session
    pub fn into_link(self) -> Arc<dyn PeerLink> {
        self.link
    }

    /// Schaltet in die nächste Verhandlungsphase
    pub fn advance(&mut self, next: NegotiationPhase) -> Result<(), PhaseError> {
        if !self.phase.permits(next, self.role) {
            return Err(PhaseError {
                role: self.role,
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!("session {} -> {:?}", self.id, next);
        self.phase = next;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.phase == NegotiationPhase::Connected
    }

    /// Session, deren Verhandlung noch nicht abgeschlossen ist
    pub fn in_flight(&self) -> bool {
        self.phase != NegotiationPhase::Connected
    }

    /// Ausgehender Anruf, dessen Offer unterwegs ist und der auf seine
    /// Antwort wartet
    pub fn awaiting_answer(&self) -> bool {
        self.role == CallRole::Caller && self.phase == NegotiationPhase::OfferSent
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("phase", &self.phase)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::peer::PeerError;
    use futures::future::BoxFuture;

    /// Tut nichts; Session-Tests interessieren sich nur für Phasen
    struct NullLink;

    impl PeerLink for NullLink {
        fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>> {
            Box::pin(async { Ok(SessionDescription::offer("")) })
        }

        fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>> {
            Box::pin(async { Ok(SessionDescription::answer("")) })
        }

        fn set_local_description(
            &self,
            _desc: SessionDescription,
        ) -> BoxFuture<'_, Result<(), PeerError>> {
            Box::pin(async { Ok(()) })
        }

        fn set_remote_description(
            &self,
            _desc: SessionDescription,
        ) -> BoxFuture<'_, Result<(), PeerError>> {
            Box::pin(async { Ok(()) })
        }

        fn wait_candidates_gathered(&self) -> BoxFuture<'_, Result<(), PeerError>> {
            Box::pin(async { Ok(()) })
        }

        fn local_description(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>> {
            Box::pin(async { Ok(SessionDescription::offer("")) })
        }

        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn caller_session() -> CallSession {
        CallSession::new(
            ParticipantId::from("peer-1"),
            CallRole::Caller,
            CallMode::Rotate,
            Arc::new(NullLink),
        )
    }

    #[test]
    fn test_caller_phases_advance_in_order() {
        let mut session = caller_session();
        assert_eq!(session.phase(), NegotiationPhase::Idle);

        for phase in [
            NegotiationPhase::OfferCreated,
            NegotiationPhase::LocalDescriptionSet,
            NegotiationPhase::CandidatesGathered,
            NegotiationPhase::OfferSent,
            NegotiationPhase::AnswerReceived,
            NegotiationPhase::Connected,
        ] {
            session.advance(phase).unwrap();
        }

        assert!(session.is_connected());
        assert!(!session.in_flight());
    }

    #[test]
    fn test_callee_phases_advance_in_order() {
        let mut session = CallSession::new(
            ParticipantId::from("peer-2"),
            CallRole::Callee,
            CallMode::None,
            Arc::new(NullLink),
        );

        for phase in [
            NegotiationPhase::RemoteDescriptionSet,
            NegotiationPhase::AnswerCreated,
            NegotiationPhase::LocalDescriptionSet,
            NegotiationPhase::AnswerSent,
            NegotiationPhase::Connected,
        ] {
            session.advance(phase).unwrap();
        }

        assert!(session.is_connected());
    }

    #[test]
    fn test_skipping_a_phase_is_rejected() {
        let mut session = caller_session();
        session.advance(NegotiationPhase::OfferCreated).unwrap();

        // Kandidaten-Phase darf nicht übersprungen werden
        let err = session.advance(NegotiationPhase::OfferSent).unwrap_err();
        assert_eq!(err.from, NegotiationPhase::OfferCreated);
        assert_eq!(err.to, NegotiationPhase::OfferSent);
        assert_eq!(session.phase(), NegotiationPhase::OfferCreated);
    }

    #[test]
    fn test_callee_cannot_take_caller_path() {
        let mut session = CallSession::new(
            ParticipantId::from("peer-3"),
            CallRole::Callee,
            CallMode::None,
            Arc::new(NullLink),
        );

        assert!(session.advance(NegotiationPhase::OfferCreated).is_err());
        assert!(session.advance(NegotiationPhase::RemoteDescriptionSet).is_ok());
    }

    #[test]
    fn test_awaiting_answer_only_while_offer_is_out() {
        let mut session = caller_session();
        assert!(!session.awaiting_answer());

        session.advance(NegotiationPhase::OfferCreated).unwrap();
        session.advance(NegotiationPhase::LocalDescriptionSet).unwrap();
        session.advance(NegotiationPhase::CandidatesGathered).unwrap();
        session.advance(NegotiationPhase::OfferSent).unwrap();
        assert!(session.awaiting_answer());

        session.advance(NegotiationPhase::AnswerReceived).unwrap();
        assert!(!session.awaiting_answer());
    }
}
