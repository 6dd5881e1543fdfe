//! Message Types für das Relay-Protokoll
//!
//! JSON-Textframes mit `type`-Tag und camelCase-Feldern. Client-Nachrichten
//! tragen einen Millisekunden-Timestamp; Server-Nachrichten werden als
//! getaggtes Enum geparst.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::call::{CallMode, CallRequest, DescriptionKind, ParticipantId};

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Punkt-zu-Punkt-Anrufanfrage; das Relay antwortet synchron mit `call_reply`
#[derive(Debug, Clone, Serialize)]
pub struct CallRequestPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: ParticipantId,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: ParticipantId,
    pub sdp: String,
    #[serde(rename = "sdpType")]
    pub sdp_type: DescriptionKind,
    pub mode: CallMode,
    #[serde(rename = "isCaller")]
    pub is_caller: bool,
    pub timestamp: i64,
}

impl CallRequestPayload {
    pub fn new(request: &CallRequest) -> Self {
        Self {
            msg_type: "call_request",
            from_peer_id: request.from.clone(),
            to_peer_id: request.to.clone(),
            sdp: request.description.sdp.clone(),
            sdp_type: request.description.kind,
            mode: request.mode,
            is_caller: request.caller,
            timestamp: now_millis(),
        }
    }
}

/// SDP Answer an den ursprünglichen Anrufer
#[derive(Debug, Clone, Serialize)]
pub struct AnswerPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: ParticipantId,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: ParticipantId,
    pub sdp: String,
    #[serde(rename = "sdpType")]
    pub sdp_type: DescriptionKind,
    pub timestamp: i64,
}

impl AnswerPayload {
    pub fn new(
        from_peer_id: ParticipantId,
        to_peer_id: ParticipantId,
        sdp: String,
        sdp_type: DescriptionKind,
    ) -> Self {
        Self {
            msg_type: "answer",
            from_peer_id,
            to_peer_id,
            sdp,
            sdp_type,
            timestamp: now_millis(),
        }
    }
}

/// Eingehenden Anruf ablehnen
#[derive(Debug, Clone, Serialize)]
pub struct RejectCallPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "fromPeerId")]
    pub from_peer_id: ParticipantId,
    #[serde(rename = "toPeerId")]
    pub to_peer_id: ParticipantId,
    pub timestamp: i64,
}

impl RejectCallPayload {
    pub fn new(from_peer_id: ParticipantId, to_peer_id: ParticipantId) -> Self {
        Self {
            msg_type: "reject_call",
            from_peer_id,
            to_peer_id,
            timestamp: now_millis(),
        }
    }
}

/// Heartbeat
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "peerId")]
    pub peer_id: ParticipantId,
    pub timestamp: i64,
}

impl HeartbeatPayload {
    pub fn new(peer_id: ParticipantId) -> Self {
        Self {
            msg_type: "heartbeat",
            peer_id,
            timestamp: now_millis(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Relay-Nachrichten
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Zuteilung der eigenen Teilnehmer-ID nach dem Verbindungsaufbau
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
        timestamp: i64,
    },

    /// Vollständiger Roster-Schnappschuss
    UserList {
        users: Vec<ParticipantId>,
        timestamp: i64,
    },

    /// Eingehender Anruf
    CallMade {
        #[serde(rename = "fromPeerId")]
        from_peer_id: ParticipantId,
        sdp: String,
        #[serde(rename = "sdpType")]
        sdp_type: DescriptionKind,
        #[serde(default)]
        mode: CallMode,
        timestamp: i64,
    },

    /// Antwort des angerufenen Teilnehmers
    AnswerMade {
        #[serde(rename = "fromPeerId")]
        from_peer_id: ParticipantId,
        sdp: String,
        #[serde(rename = "sdpType")]
        sdp_type: DescriptionKind,
        timestamp: i64,
    },

    /// Synchrone Antwort des Relays auf eine Anrufanfrage
    CallReply {
        sdp: String,
        #[serde(rename = "sdpType")]
        sdp_type: DescriptionKind,
        timestamp: i64,
    },

    /// Teilnehmer hat das Relay verlassen
    UserRemoved {
        #[serde(rename = "peerId")]
        peer_id: ParticipantId,
        timestamp: i64,
    },

    /// Anruf wurde abgelehnt
    CallRejected {
        #[serde(rename = "byPeerId")]
        by_peer_id: ParticipantId,
        timestamp: i64,
    },

    /// Fehler vom Relay
    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    /// Heartbeat-Antwort
    Pong { timestamp: i64 },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::SessionDescription;

    #[test]
    fn test_call_request_wire_format() {
        let request = CallRequest {
            from: ParticipantId::from("me"),
            to: ParticipantId::from("them"),
            description: SessionDescription::offer("v=0"),
            mode: CallMode::Rotate,
            caller: true,
        };

        let value = serde_json::to_value(CallRequestPayload::new(&request)).unwrap();
        assert_eq!(value["type"], "call_request");
        assert_eq!(value["fromPeerId"], "me");
        assert_eq!(value["toPeerId"], "them");
        assert_eq!(value["sdp"], "v=0");
        assert_eq!(value["sdpType"], "offer");
        assert_eq!(value["mode"], "rotate");
        assert_eq!(value["isCaller"], true);
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_answer_wire_format() {
        let payload = AnswerPayload::new(
            ParticipantId::from("b"),
            ParticipantId::from("a"),
            "v=0".to_string(),
            DescriptionKind::Answer,
        );

        let value = serde_json::to_value(payload).unwrap();
        assert_eq!(value["type"], "answer");
        assert_eq!(value["sdpType"], "answer");
        assert_eq!(value["toPeerId"], "a");
    }

    #[test]
    fn test_parse_user_list() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"user_list","users":["a","b"],"timestamp":1}"#)
                .unwrap();

        match msg {
            ServerMessage::UserList { users, .. } => {
                assert_eq!(
                    users,
                    vec![ParticipantId::from("a"), ParticipantId::from("b")]
                );
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_call_made_without_mode() {
        // Der Modus ist optional; ohne Angabe gilt `none`
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"call_made","fromPeerId":"a","sdp":"v=0","sdpType":"offer","timestamp":2}"#,
        )
        .unwrap();

        match msg {
            ServerMessage::CallMade {
                from_peer_id, mode, ..
            } => {
                assert_eq!(from_peer_id, ParticipantId::from("a"));
                assert_eq!(mode, CallMode::None);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_call_reply() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"call_reply","sdp":"v=0","sdpType":"answer","timestamp":3}"#,
        )
        .unwrap();

        assert!(matches!(
            msg,
            ServerMessage::CallReply {
                sdp_type: DescriptionKind::Answer,
                ..
            }
        ));
    }
}
