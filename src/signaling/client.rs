//! WebSocket Client für den Relay-Server
//!
//! Verwaltet die Verbindung zum Relay:
//! - Handshake (welcome mit zugeteilter Teilnehmer-ID)
//! - Eingehende Nachrichten parsen und als Events verteilen
//! - Punkt-zu-Punkt-Anrufanfrage mit synchroner Antwort
//! - Heartbeat-Keeping

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::messages::*;
use crate::call::{
    BusError, CallMode, CallRequest, ParticipantId, SessionDescription, SignalBus,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    #[error("invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected to relay")]
    NotConnected,

    #[error("failed to send message: {0}")]
    SendFailed(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("another call request is already pending")]
    RequestPending,

    #[error("connection closed while awaiting call reply")]
    ReplyLost,

    #[error("server error: {code} - {message}")]
    ServerError { code: i32, message: String },
}

impl From<RelayError> for BusError {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::NotConnected => BusError::Unavailable(error.to_string()),
            RelayError::SendFailed(_) => BusError::SendFailed(error.to_string()),
            other => BusError::RequestFailed(other.to_string()),
        }
    }
}

// ============================================================================
// RELAY EVENTS
// ============================================================================

/// Events, die der RelayClient aus Server-Nachrichten ableitet
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung getrennt
    Disconnected,

    /// Vollständiger Roster-Schnappschuss
    RosterUpdate(Vec<ParticipantId>),

    /// Eingehender Anruf
    IncomingCall {
        from: ParticipantId,
        offer: SessionDescription,
        mode: CallMode,
    },

    /// Antwort auf einen ausgehenden Anruf
    AnswerReady {
        from: ParticipantId,
        answer: SessionDescription,
    },

    /// Teilnehmer hat das Relay verlassen
    ParticipantDeparted(ParticipantId),

    /// Anruf wurde abgelehnt
    CallDeclined { by: ParticipantId },

    /// Fehler vom Relay
    Error { code: i32, message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Default)]
struct ClientState {
    is_connected: bool,
    local_id: Option<ParticipantId>,
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct RelayClient {
    relay_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    pending_reply: Arc<Mutex<Option<oneshot::Sender<SessionDescription>>>>,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl RelayClient {
    pub fn new(relay_url: String) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            relay_url,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            pending_reply: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die vom Relay zugeteilte eigene ID zurück (falls verbunden)
    pub fn local_id(&self) -> Option<ParticipantId> {
        self.state.read().local_id.clone()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und wartet auf die Zuteilung der eigenen ID
    pub async fn connect(&mut self) -> Result<ParticipantId, RelayError> {
        tracing::info!("Connecting to relay: {}", self.relay_url);

        let (ws_stream, _) = connect_async(&self.relay_url)
            .await
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);

        {
            let mut state = self.state.write();
            state.is_connected = true;
        }
        let _ = self.event_tx.send(RelayEvent::Connected);

        // Channel für die welcome-Nachricht des Handshakes
        let (welcome_tx, mut welcome_rx) = mpsc::channel::<Result<ParticipantId, RelayError>>(1);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let pending = Arc::clone(&self.pending_reply);

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            Self::handle_server_message(
                                msg,
                                &state_clone,
                                &event_tx,
                                &pending,
                                &welcome_tx,
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring malformed relay message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut state = state_clone.write();
                state.is_connected = false;
            }
            // Eine hängende Anrufanfrage scheitert mit der Verbindung
            pending.lock().take();
            let _ = event_tx.send(RelayEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        // Auf welcome warten (max 10 Sekunden)
        tokio::select! {
            result = welcome_rx.recv() => {
                match result {
                    Some(Ok(id)) => Ok(id),
                    Some(Err(e)) => Err(e),
                    None => Err(RelayError::HandshakeFailed("no welcome received".to_string())),
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(10)) => {
                Err(RelayError::HandshakeFailed("timeout".to_string()))
            }
        }
    }

    /// Punkt-zu-Punkt-Anrufanfrage; wartet auf die synchrone Antwort
    ///
    /// Die Verhandlung kennt keine Fristen; ein Verbindungsabriss lässt die
    /// Anfrage mit `ReplyLost` scheitern.
    pub async fn call_peer(
        &self,
        request: &CallRequest,
    ) -> Result<SessionDescription, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending = self.pending_reply.lock();
            if pending.is_some() {
                return Err(RelayError::RequestPending);
            }
            *pending = Some(reply_tx);
        }

        if let Err(e) = self.send_message(&CallRequestPayload::new(request)) {
            self.pending_reply.lock().take();
            return Err(e);
        }

        reply_rx.await.map_err(|_| RelayError::ReplyLost)
    }

    /// Sendet ein SDP Answer an den ursprünglichen Anrufer
    pub fn send_answer(
        &self,
        to: &ParticipantId,
        answer: &SessionDescription,
    ) -> Result<(), RelayError> {
        let from = self.require_local_id()?;
        self.send_message(&AnswerPayload::new(
            from,
            to.clone(),
            answer.sdp.clone(),
            answer.kind,
        ))
    }

    /// Lehnt einen eingehenden Anruf ab
    pub fn reject_call(&self, to: &ParticipantId) -> Result<(), RelayError> {
        let from = self.require_local_id()?;
        self.send_message(&RejectCallPayload::new(from, to.clone()))
    }

    /// Sendet einen Heartbeat
    pub fn send_heartbeat(&self) -> Result<(), RelayError> {
        let peer_id = self.require_local_id()?;
        self.send_message(&HeartbeatPayload::new(peer_id))
    }

    /// Startet einen Heartbeat-Task, der die Verbindung offen hält
    pub fn start_heartbeat(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(25));
            loop {
                interval.tick().await;
                if client.is_connected() {
                    if let Err(e) = client.send_heartbeat() {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                    }
                } else {
                    tracing::info!("Heartbeat: client disconnected, stopping task");
                    break;
                }
            }
        });
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn require_local_id(&self) -> Result<ParticipantId, RelayError> {
        self.state
            .read()
            .local_id
            .clone()
            .ok_or(RelayError::NotConnected)
    }

    /// Serialisiert und verschickt eine Nachricht (non-blocking)
    fn send_message<T: serde::Serialize>(&self, payload: &T) -> Result<(), RelayError> {
        let tx = self.tx.as_ref().ok_or(RelayError::NotConnected)?;

        let msg = serde_json::to_string(payload).map_err(|e| RelayError::SendFailed(e.to_string()))?;

        tx.try_send(msg)
            .map_err(|e| RelayError::SendFailed(e.to_string()))
    }

    /// Verarbeitet eingehende Server-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<RelayEvent>,
        pending: &Arc<Mutex<Option<oneshot::Sender<SessionDescription>>>>,
        welcome_tx: &mpsc::Sender<Result<ParticipantId, RelayError>>,
    ) {
        match msg {
            ServerMessage::Welcome { peer_id, .. } => {
                tracing::info!("Registered with relay as {}", peer_id);
                {
                    let mut s = state.write();
                    s.local_id = Some(peer_id.clone());
                }
                let _ = welcome_tx.send(Ok(peer_id)).await;
            }

            ServerMessage::UserList { users, .. } => {
                let _ = event_tx.send(RelayEvent::RosterUpdate(users));
            }

            ServerMessage::CallMade {
                from_peer_id,
                sdp,
                sdp_type,
                mode,
                ..
            } => {
                let _ = event_tx.send(RelayEvent::IncomingCall {
                    from: from_peer_id,
                    offer: SessionDescription {
                        kind: sdp_type,
                        sdp,
                    },
                    mode,
                });
            }

            ServerMessage::AnswerMade {
                from_peer_id,
                sdp,
                sdp_type,
                ..
            } => {
                let _ = event_tx.send(RelayEvent::AnswerReady {
                    from: from_peer_id,
                    answer: SessionDescription {
                        kind: sdp_type,
                        sdp,
                    },
                });
            }

            ServerMessage::CallReply { sdp, sdp_type, .. } => {
                // Antwort der laufenden Anrufanfrage zustellen
                let reply_tx = pending.lock().take();
                match reply_tx {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(SessionDescription {
                            kind: sdp_type,
                            sdp,
                        });
                    }
                    None => {
                        tracing::warn!("Received call reply without pending request");
                    }
                }
            }

            ServerMessage::UserRemoved { peer_id, .. } => {
                let _ = event_tx.send(RelayEvent::ParticipantDeparted(peer_id));
            }

            ServerMessage::CallRejected { by_peer_id, .. } => {
                let _ = event_tx.send(RelayEvent::CallDeclined { by: by_peer_id });
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Relay error {}: {}", code, message);
                // Fehler während des Handshakes auch dort melden
                let _ = welcome_tx
                    .send(Err(RelayError::ServerError {
                        code,
                        message: message.clone(),
                    }))
                    .await;
                let _ = event_tx.send(RelayEvent::Error { code, message });
            }

            ServerMessage::Pong { .. } => {
                // Heartbeat-Antwort - nichts zu tun
            }
        }
    }
}

// ============================================================================
// SIGNAL BUS IMPLEMENTATION
// ============================================================================

impl SignalBus for RelayClient {
    fn request_call(
        &self,
        request: CallRequest,
    ) -> BoxFuture<'_, Result<SessionDescription, BusError>> {
        Box::pin(async move { self.call_peer(&request).await.map_err(BusError::from) })
    }

    fn send_answer(
        &self,
        to: ParticipantId,
        answer: SessionDescription,
    ) -> BoxFuture<'_, Result<(), BusError>> {
        let result = RelayClient::send_answer(self, &to, &answer).map_err(BusError::from);
        Box::pin(async move { result })
    }

    fn decline_call(&self, to: ParticipantId) -> BoxFuture<'_, Result<(), BusError>> {
        let result = self.reject_call(&to).map_err(BusError::from);
        Box::pin(async move { result })
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("relay_url", &self.relay_url)
            .field("state", &*self.state.read())
            .finish()
    }
}
