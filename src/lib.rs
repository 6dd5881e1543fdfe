//! visavis - P2P Video-Call Client mit Relay-Signaling
//!
//! Ein Signaling-Client, der Audio/Video-Sessions zwischen zwei Teilnehmern
//! über einen zentralen Relay-Server aufbaut:
//! - Offer/Answer-Verhandlung mit Kandidaten-Sammlung (webrtc-rs)
//! - Relay-Bus über WebSocket (Roster, Anrufe, Ablehnungen)
//! - Lokale Audio-Beschaffung (cpal); Ausfall degradiert still
//! - Injizierbare Transport- und Peer-Primitiven für Tests

pub mod call;
pub mod config;
pub mod media;
pub mod roster;
pub mod signaling;

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use call::{
    AcceptAll, CallError, CallEvent, CallMode, CallOrchestrator, ConsentPolicy, NegotiationPhase,
    ParticipantId, WebRtcLinkFactory,
};
use config::{CallConfig, ConfigError};
use media::MediaCapture;
use roster::{Roster, RosterEvent};
use signaling::{RelayClient, RelayError, RelayEvent};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Call(#[from] CallError),
}

// ============================================================================
// CLIENT EVENTS
// ============================================================================

/// Events für die Darstellungsschicht
///
/// Roster-Einträge werden per Teilnehmer-ID adressiert; ein Klick auf einen
/// Eintrag entspricht `CallApp::call`.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    RosterJoined(ParticipantId),
    RosterLeft(ParticipantId),
    IncomingCall { from: ParticipantId, mode: CallMode },
    CallPhase { peer: ParticipantId, phase: NegotiationPhase },
    CallConnected { peer: ParticipantId },
    CallFailed { peer: ParticipantId, reason: String },
    CallDeclined { by: ParticipantId },
    RelayDisconnected,
}

// ============================================================================
// CALL APP
// ============================================================================

/// Verdrahtet Relay, Orchestrator, Roster und Medien zu einem Client
pub struct CallApp {
    config: CallConfig,
    relay: Arc<RelayClient>,
    orchestrator: Arc<CallOrchestrator>,
    roster: Arc<Roster>,
    media: Arc<Mutex<Option<MediaCapture>>>,
    local_id: ParticipantId,
    event_tx: broadcast::Sender<ClientEvent>,
}

impl CallApp {
    /// Verbindet mit dem Relay und startet die Event-Verarbeitung
    pub async fn connect(config: CallConfig) -> Result<Self, ClientError> {
        Self::connect_with_policy(config, Arc::new(AcceptAll)).await
    }

    /// Wie `connect`, mit eigener Annahme-Policy für eingehende Anrufe
    pub async fn connect_with_policy(
        config: CallConfig,
        policy: Arc<dyn ConsentPolicy>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        // Medien beschaffen; Fehlschlag degradiert still, Anrufe bleiben
        // möglich (der lokale Stream fehlt dann einfach)
        let media = match MediaCapture::acquire() {
            Ok(capture) => Some(capture),
            Err(e) => {
                tracing::warn!("Media acquisition failed, continuing without local audio: {}", e);
                None
            }
        };
        let media = Arc::new(Mutex::new(media));

        let mut relay = RelayClient::new(config.relay_url.clone());
        let relay_events = relay.subscribe();
        let local_id = relay.connect().await?;
        let relay = Arc::new(relay);
        relay.start_heartbeat();

        let links = Arc::new(WebRtcLinkFactory::new(
            config.ice_servers(),
            Arc::clone(&media),
        ));
        let orchestrator = Arc::new(CallOrchestrator::with_policy(
            Arc::clone(&relay) as Arc<dyn call::SignalBus>,
            links,
            policy,
        ));
        orchestrator.set_local_id(local_id.clone());

        let roster = Arc::new(Roster::new());
        let (event_tx, _) = broadcast::channel(100);

        let app = Self {
            config,
            relay,
            orchestrator,
            roster,
            media,
            local_id,
            event_tx,
        };

        app.spawn_event_pump(relay_events);
        app.spawn_call_event_forwarding();
        app.spawn_roster_forwarding();

        tracing::info!("Connected to relay as {}", app.local_id);
        Ok(app)
    }

    /// Gibt einen Event-Receiver für die Darstellungsschicht zurück
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.event_tx.subscribe()
    }

    /// Die vom Relay zugeteilte eigene ID
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn orchestrator(&self) -> &Arc<CallOrchestrator> {
        &self.orchestrator
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Startet einen Anruf zum angeklickten Roster-Eintrag
    pub async fn call(&self, peer: ParticipantId) -> Result<(), ClientError> {
        self.call_with_mode(peer, self.config.default_mode).await
    }

    pub async fn call_with_mode(
        &self,
        peer: ParticipantId,
        mode: CallMode,
    ) -> Result<(), ClientError> {
        self.orchestrator
            .initiate_call(peer, true, mode)
            .await
            .map_err(ClientError::from)
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(media) = self.media.lock().as_ref() {
            media.set_muted(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.media
            .lock()
            .as_ref()
            .map(|media| media.is_muted())
            .unwrap_or(false)
    }

    /// Gibt die Audio-Pegel zurück (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.media
            .lock()
            .as_ref()
            .map(|media| media.levels())
            .unwrap_or((0.0, 0.0))
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn spawn_event_pump(&self, mut relay_events: broadcast::Receiver<RelayEvent>) {
        let roster = Arc::clone(&self.roster);
        let orchestrator = Arc::clone(&self.orchestrator);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Ok(event) = relay_events.recv().await {
                handle_relay_event(event, &roster, &orchestrator, &event_tx).await;
            }
        });
    }

    fn spawn_call_event_forwarding(&self) {
        let mut call_events = self.orchestrator.subscribe();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Ok(event) = call_events.recv().await {
                let forwarded = match event {
                    CallEvent::PhaseChanged { peer, phase } => {
                        ClientEvent::CallPhase { peer, phase }
                    }
                    CallEvent::Connected { peer } => ClientEvent::CallConnected { peer },
                    CallEvent::Failed { peer, reason } => {
                        ClientEvent::CallFailed { peer, reason }
                    }
                    CallEvent::Declined { by } => ClientEvent::CallDeclined { by },
                };
                let _ = event_tx.send(forwarded);
            }
        });
    }

    fn spawn_roster_forwarding(&self) {
        let mut roster_events = self.roster.subscribe();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Ok(event) = roster_events.recv().await {
                let forwarded = match event {
                    RosterEvent::Joined(id) => ClientEvent::RosterJoined(id),
                    RosterEvent::Left(id) => ClientEvent::RosterLeft(id),
                };
                let _ = event_tx.send(forwarded);
            }
        });
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("local_id", &self.local_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// EVENT HANDLER
// ============================================================================

/// Verarbeitet Relay-Events und verteilt sie auf Roster und Orchestrator
async fn handle_relay_event(
    event: RelayEvent,
    roster: &Arc<Roster>,
    orchestrator: &Arc<CallOrchestrator>,
    event_tx: &broadcast::Sender<ClientEvent>,
) {
    match event {
        RelayEvent::Connected => {
            tracing::info!("Connected to relay");
        }

        RelayEvent::Disconnected => {
            tracing::info!("Disconnected from relay");
            let _ = event_tx.send(ClientEvent::RelayDisconnected);
        }

        RelayEvent::RosterUpdate(users) => {
            let added = roster.merge_snapshot(&users);
            tracing::debug!("Roster snapshot merged, {} new entries", added);
        }

        RelayEvent::IncomingCall { from, offer, mode } => {
            tracing::info!("Incoming call from {}", from);
            let _ = event_tx.send(ClientEvent::IncomingCall {
                from: from.clone(),
                mode,
            });
            if let Err(e) = orchestrator.handle_incoming_call(from, offer, mode).await {
                tracing::error!("Failed to handle incoming call: {}", e);
            }
        }

        RelayEvent::AnswerReady { from, answer } => {
            if let Err(e) = orchestrator.handle_answer(from, answer).await {
                tracing::error!("Failed to handle answer: {}", e);
            }
        }

        RelayEvent::ParticipantDeparted(id) => {
            // Unbekannte IDs sind ein No-Op
            roster.remove(&id);
        }

        RelayEvent::CallDeclined { by } => {
            orchestrator.handle_declined(by).await;
        }

        RelayEvent::Error { code, message } => {
            tracing::error!("Relay error {}: {}", code, message);
        }
    }
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("visavis=debug".parse().unwrap())
                .add_directive("webrtc=warn".parse().unwrap()),
        )
        .init();
}
