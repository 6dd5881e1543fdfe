//! Signaling Module - WebSocket Client für den Relay-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay:
//! - Verbindung aufbauen und halten (Heartbeat)
//! - Nachrichten serialisieren und senden
//! - Eingehende Nachrichten parsen und als Events verteilen
//!

mod client;
mod messages;

pub use client::{RelayClient, RelayError, RelayEvent};
pub use messages::*;
