//! Call Orchestrator - Offer/Answer-Verhandlung über den Relay-Bus
//!
//! Kernstück des Crates: orchestriert den Verbindungsaufbau zwischen zwei
//! Teilnehmern. Transport (`SignalBus`) und Peer-Connection (`LinkFactory`)
//! werden als Abhängigkeiten injiziert, damit der Ablauf mit Mock-Primitiven
//! testbar bleibt. Pro Anrufversuch entsteht eine frische `CallSession`;
//! scheitert ein Schritt, wird die Session abgeräumt und der Fehler
//! typisiert gemeldet.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::peer::{LinkFactory, PeerError, PeerLink};
use super::session::{
    CallMode, CallRole, CallSession, NegotiationPhase, ParticipantId, PhaseError,
    SessionDescription,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler des injizierten Transports
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("failed to send over relay: {0}")]
    SendFailed(String),

    #[error("call request failed: {0}")]
    RequestFailed(String),
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("already calling {0}")]
    AlreadyCalling(ParticipantId),

    #[error("own participant id not yet assigned")]
    NotRegistered,

    #[error("no active call session")]
    NoActiveSession,

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

// ============================================================================
// TRAIT SEAMS
// ============================================================================

/// Punkt-zu-Punkt-Anfrage an das Relay
///
/// Die synchrone Antwort des Relays trägt die Remote-Description.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub description: SessionDescription,
    pub mode: CallMode,
    pub caller: bool,
}

/// Ausgehende Seite des Relay-Busses, wie der Orchestrator sie benötigt
pub trait SignalBus: Send + Sync {
    /// Sendet die Anrufanfrage und wartet auf die synchrone Antwort
    fn request_call(
        &self,
        request: CallRequest,
    ) -> BoxFuture<'_, Result<SessionDescription, BusError>>;

    fn send_answer(
        &self,
        to: ParticipantId,
        answer: SessionDescription,
    ) -> BoxFuture<'_, Result<(), BusError>>;

    fn decline_call(&self, to: ParticipantId) -> BoxFuture<'_, Result<(), BusError>>;
}

/// Entscheidet, ob ein eingehender Anruf angenommen wird
///
/// `answered_before` meldet, ob diese Seite schon einmal eine Antwort
/// angewendet hat; die beobachtete Variante fragt erst ab dem zweiten
/// Anruf nach.
pub trait ConsentPolicy: Send + Sync {
    fn allow_call(&self, from: ParticipantId, answered_before: bool) -> BoxFuture<'_, bool>;
}

/// Nimmt jeden eingehenden Anruf ohne Rückfrage an
pub struct AcceptAll;

impl ConsentPolicy for AcceptAll {
    fn allow_call(&self, _from: ParticipantId, _answered_before: bool) -> BoxFuture<'_, bool> {
        Box::pin(async { true })
    }
}

// ============================================================================
// CALL EVENTS
// ============================================================================

/// Events, die der Orchestrator für die Darstellungsschicht auslöst
#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged {
        peer: ParticipantId,
        phase: NegotiationPhase,
    },
    Connected {
        peer: ParticipantId,
    },
    Failed {
        peer: ParticipantId,
        reason: String,
    },
    Declined {
        by: ParticipantId,
    },
}

// ============================================================================
// CALL ORCHESTRATOR
// ============================================================================

pub struct CallOrchestrator {
    bus: Arc<dyn SignalBus>,
    links: Arc<dyn LinkFactory>,
    policy: Arc<dyn ConsentPolicy>,
    local_id: Mutex<Option<ParticipantId>>,
    session: Mutex<Option<CallSession>>,
    /// Diese Seite hat bereits eine Antwort angewendet (Eingabe der Policy)
    answered_once: AtomicBool,
    /// Der einmalige Folgeanruf nach einer Antwort wurde schon ausgelöst
    followed_up: AtomicBool,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallOrchestrator {
    pub fn new(bus: Arc<dyn SignalBus>, links: Arc<dyn LinkFactory>) -> Self {
        Self::with_policy(bus, links, Arc::new(AcceptAll))
    }

    pub fn with_policy(
        bus: Arc<dyn SignalBus>,
        links: Arc<dyn LinkFactory>,
        policy: Arc<dyn ConsentPolicy>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            bus,
            links,
            policy,
            local_id: Mutex::new(None),
            session: Mutex::new(None),
            answered_once: AtomicBool::new(false),
            followed_up: AtomicBool::new(false),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Hinterlegt die vom Relay zugeteilte eigene ID
    pub fn set_local_id(&self, id: ParticipantId) {
        *self.local_id.lock() = Some(id);
    }

    pub fn local_id(&self) -> Option<ParticipantId> {
        self.local_id.lock().clone()
    }

    /// Gegenstelle der aktiven Session (falls vorhanden)
    pub fn current_peer(&self) -> Option<ParticipantId> {
        self.session.lock().as_ref().map(|s| s.peer().clone())
    }

    /// Verhandlungsphase der aktiven Session (falls vorhanden)
    pub fn phase(&self) -> Option<NegotiationPhase> {
        self.session.lock().as_ref().map(|s| s.phase())
    }

    // ========================================================================
    // OUTGOING CALLS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Ablauf: Offer erzeugen, als Local-Description anwenden, auf den
    /// Abschluss der Kandidaten-Suche warten, die finalisierte Description
    /// als Anrufanfrage verschicken und die synchrone Antwort des Relays
    /// als Remote-Description übernehmen. Ein laufender Versuch blockiert
    /// den zweiten; bei einem Fehler wird die Session abgeräumt.
    pub async fn initiate_call(
        &self,
        peer: ParticipantId,
        caller: bool,
        mode: CallMode,
    ) -> Result<(), CallError> {
        let local = self.local_id().ok_or(CallError::NotRegistered)?;

        if let Some(busy) = self.in_flight_peer() {
            return Err(CallError::AlreadyCalling(busy));
        }

        // Frischer Link und frische Session pro Anrufversuch
        let link = self.links.create_link().await?;
        let session = CallSession::new(
            peer.clone(),
            CallRole::Caller,
            mode,
            Arc::clone(&link),
        );
        let session_id = session.id();

        let in_flight = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| s.in_flight()) {
                true
            } else {
                if let Some(previous) = slot.replace(session) {
                    let stale = previous.into_link();
                    tokio::spawn(async move { stale.close().await });
                }
                false
            }
        };
        if in_flight {
            link.close().await;
            return Err(CallError::AlreadyCalling(peer));
        }

        if caller {
            // Neuer, vom Benutzer gestarteter Anruf setzt den Folgeanruf-Riegel zurück
            self.followed_up.store(false, Ordering::SeqCst);
        }

        tracing::info!("Calling {} (mode {:?})", peer, mode);

        match self
            .drive_offer(session_id, local, peer.clone(), caller, mode, link)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_session(session_id, &peer, &e).await;
                Err(e)
            }
        }
    }

    /// Die Offer-Sequenz; Fehlerbehandlung liegt beim Aufrufer
    async fn drive_offer(
        &self,
        session_id: Uuid,
        local: ParticipantId,
        peer: ParticipantId,
        caller: bool,
        mode: CallMode,
        link: Arc<dyn PeerLink>,
    ) -> Result<(), CallError> {
        let offer = link.create_offer().await?;
        self.advance(session_id, NegotiationPhase::OfferCreated)?;

        link.set_local_description(offer).await?;
        self.advance(session_id, NegotiationPhase::LocalDescriptionSet)?;

        // Erst nach abgeschlossener Kandidaten-Suche darf die Anfrage raus;
        // ist das Gathering schon fertig, kehrt der Link sofort zurück
        link.wait_candidates_gathered().await?;
        self.advance(session_id, NegotiationPhase::CandidatesGathered)?;

        let description = link.local_description().await?;
        let reply = self
            .bus
            .request_call(CallRequest {
                from: local,
                to: peer.clone(),
                description,
                mode,
                caller,
            })
            .await?;
        self.advance(session_id, NegotiationPhase::OfferSent)?;
        self.advance(session_id, NegotiationPhase::AnswerReceived)?;

        link.set_remote_description(reply).await?;
        self.advance(session_id, NegotiationPhase::Connected)?;

        tracing::info!("Call to {} connected", peer);
        self.emit(CallEvent::Connected { peer });
        Ok(())
    }

    // ========================================================================
    // INCOMING CALLS
    // ========================================================================

    /// Beantwortet einen vom Relay gemeldeten eingehenden Anruf
    ///
    /// Die Policy entscheidet über Annahme; eine Ablehnung geht als
    /// `reject` zurück an den Anrufer. Bei Annahme wird das Offer als
    /// Remote-Description übernommen, die Antwort erzeugt, als
    /// Local-Description angewendet und erst danach verschickt.
    pub async fn handle_incoming_call(
        &self,
        from: ParticipantId,
        offer: SessionDescription,
        mode: CallMode,
    ) -> Result<(), CallError> {
        let answered_before = self.answered_once.load(Ordering::SeqCst);
        if !self.policy.allow_call(from.clone(), answered_before).await {
            tracing::info!("Declining call from {}", from);
            self.bus.decline_call(from).await?;
            return Ok(());
        }

        let link = self.links.create_link().await?;
        let session = CallSession::new(
            from.clone(),
            CallRole::Callee,
            mode,
            Arc::clone(&link),
        );
        let session_id = session.id();

        if let Some(previous) = self.session.lock().replace(session) {
            let stale = previous.into_link();
            tokio::spawn(async move { stale.close().await });
        }

        tracing::info!("Answering call from {} (mode {:?})", from, mode);

        match self
            .drive_answer(session_id, from.clone(), offer, link)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_session(session_id, &from, &e).await;
                Err(e)
            }
        }
    }

    /// Die Answer-Sequenz; Fehlerbehandlung liegt beim Aufrufer
    async fn drive_answer(
        &self,
        session_id: Uuid,
        from: ParticipantId,
        offer: SessionDescription,
        link: Arc<dyn PeerLink>,
    ) -> Result<(), CallError> {
        link.set_remote_description(offer).await?;
        self.advance(session_id, NegotiationPhase::RemoteDescriptionSet)?;

        let answer = link.create_answer().await?;
        self.advance(session_id, NegotiationPhase::AnswerCreated)?;

        // Local-Description anwenden, bevor die Antwort das Haus verlässt
        link.set_local_description(answer.clone()).await?;
        self.advance(session_id, NegotiationPhase::LocalDescriptionSet)?;

        self.bus.send_answer(from.clone(), answer).await?;
        self.advance(session_id, NegotiationPhase::AnswerSent)?;
        self.advance(session_id, NegotiationPhase::Connected)?;

        self.answered_once.store(true, Ordering::SeqCst);
        tracing::info!("Call from {} connected", from);
        self.emit(CallEvent::Connected { peer: from });
        Ok(())
    }

    // ========================================================================
    // ANSWERS & DECLINES
    // ========================================================================

    /// Verarbeitet eine vom Relay gemeldete Antwort
    ///
    /// Wartet ein ausgehender Anruf auf genau diese Antwort, wird sie als
    /// Remote-Description übernommen. Ohne laufenden ausgehenden Anruf wird
    /// stattdessen einmalig ein Folgeanruf an den Absender gestartet -
    /// der Ersatz für ein fehlendes Signaling-Ack.
    pub async fn handle_answer(
        &self,
        from: ParticipantId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        let awaiting = {
            let slot = self.session.lock();
            slot.as_ref()
                .filter(|s| s.awaiting_answer() && s.peer() == &from)
                .map(|s| (s.id(), s.link()))
        };

        if let Some((session_id, link)) = awaiting {
            self.advance(session_id, NegotiationPhase::AnswerReceived)?;
            link.set_remote_description(answer).await?;
            self.advance(session_id, NegotiationPhase::Connected)?;
            self.emit(CallEvent::Connected { peer: from });
            return Ok(());
        }

        // Verspätete Antwort einer bereits verbundenen Gegenstelle frischt
        // nur deren Remote-Description auf
        let connected = {
            let slot = self.session.lock();
            slot.as_ref()
                .filter(|s| s.is_connected() && s.peer() == &from)
                .map(|s| (s.link(), s.mode()))
        };

        let follow_mode = match connected {
            Some((link, mode)) => {
                link.set_remote_description(answer).await?;
                mode
            }
            None => CallMode::default(),
        };

        let busy = self
            .session
            .lock()
            .as_ref()
            .is_some_and(|s| s.in_flight());
        if !busy && !self.followed_up.swap(true, Ordering::SeqCst) {
            tracing::debug!("Answer from {} without outgoing call, following up", from);
            return self.initiate_call(from, false, follow_mode).await;
        }

        Ok(())
    }

    /// Die Gegenstelle hat den Anruf abgelehnt
    pub async fn handle_declined(&self, by: ParticipantId) {
        let link = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| s.peer() == &by) {
                slot.take().map(CallSession::into_link)
            } else {
                None
            }
        };

        if let Some(link) = link {
            link.close().await;
        }

        tracing::info!("Call declined by {}", by);
        self.emit(CallEvent::Declined { by });
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn in_flight_peer(&self) -> Option<ParticipantId> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| s.in_flight())
            .map(|s| s.peer().clone())
    }

    /// Schaltet die aktive Session weiter und meldet die neue Phase
    fn advance(&self, session_id: Uuid, next: NegotiationPhase) -> Result<(), CallError> {
        let peer = {
            let mut slot = self.session.lock();
            let session = slot
                .as_mut()
                .filter(|s| s.id() == session_id)
                .ok_or(CallError::NoActiveSession)?;
            session.advance(next)?;
            session.peer().clone()
        };

        self.emit(CallEvent::PhaseChanged { peer, phase: next });
        Ok(())
    }

    /// Räumt die Session nach einem Fehler ab und meldet den Fehlschlag
    async fn reset_session(&self, session_id: Uuid, peer: &ParticipantId, error: &CallError) {
        tracing::error!("Call with {} failed: {}", peer, error);

        let link = {
            let mut slot = self.session.lock();
            if slot.as_ref().is_some_and(|s| s.id() == session_id) {
                slot.take().map(CallSession::into_link)
            } else {
                None
            }
        };

        if let Some(link) = link {
            link.close().await;
        }

        self.emit(CallEvent::Failed {
            peer: peer.clone(),
            reason: error.to_string(),
        });
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("local_id", &*self.local_id.lock())
            .field("session", &*self.session.lock())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
