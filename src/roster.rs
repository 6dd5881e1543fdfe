//! Roster - Spiegel der verbundenen Teilnehmer
//!
//! Das Relay besitzt die Teilnehmerliste; dieser Spiegel ergänzt aus
//! Schnappschüssen nur unbekannte IDs und entfernt Einträge ausschließlich
//! bei expliziter Abmeldung. Er läuft der Sicht des Relays damit höchstens
//! hinterher, nie voraus.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::call::ParticipantId;

// ============================================================================
// ROSTER TYPES
// ============================================================================

/// Eintrag im Roster; `first_seen` ist der Zeitpunkt der ersten Sichtung
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub id: ParticipantId,
    pub first_seen: DateTime<Utc>,
}

/// Events für die Darstellungsschicht; Einträge werden per ID adressiert
#[derive(Debug, Clone)]
pub enum RosterEvent {
    Joined(ParticipantId),
    Left(ParticipantId),
}

// ============================================================================
// ROSTER
// ============================================================================

pub struct Roster {
    entries: RwLock<HashMap<ParticipantId, RosterEntry>>,
    event_tx: broadcast::Sender<RosterEvent>,
}

impl Roster {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            entries: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<RosterEvent> {
        self.event_tx.subscribe()
    }

    /// Übernimmt einen vollständigen Schnappschuss
    ///
    /// Nur unbekannte IDs werden ergänzt; bereits bekannte bleiben
    /// unverändert (idempotent). Gibt die Anzahl neuer Einträge zurück.
    pub fn merge_snapshot(&self, ids: &[ParticipantId]) -> usize {
        let mut joined = Vec::new();

        {
            let mut entries = self.entries.write();
            for id in ids {
                if !entries.contains_key(id) {
                    entries.insert(
                        id.clone(),
                        RosterEntry {
                            id: id.clone(),
                            first_seen: Utc::now(),
                        },
                    );
                    joined.push(id.clone());
                }
            }
        }

        let added = joined.len();
        for id in joined {
            let _ = self.event_tx.send(RosterEvent::Joined(id));
        }
        added
    }

    /// Entfernt einen Teilnehmer nach expliziter Abmeldung
    ///
    /// Unbekannte IDs sind ein No-Op.
    pub fn remove(&self, id: &ParticipantId) -> bool {
        let removed = self.entries.write().remove(id).is_some();
        if removed {
            let _ = self.event_tx.send(RosterEvent::Left(id.clone()));
        }
        removed
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Alle Teilnehmer, stabil sortiert nach erster Sichtung
    pub fn participants(&self) -> Vec<ParticipantId> {
        let entries = self.entries.read();
        let mut all: Vec<&RosterEntry> = entries.values().collect();
        all.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        all.into_iter().map(|entry| entry.id.clone()).collect()
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<ParticipantId> {
        raw.iter().map(|id| ParticipantId::from(*id)).collect()
    }

    #[test]
    fn test_snapshot_merge_is_idempotent() {
        let roster = Roster::new();

        assert_eq!(roster.merge_snapshot(&ids(&["a", "b"])), 2);
        // Derselbe Schnappschuss erzeugt keine Duplikate
        assert_eq!(roster.merge_snapshot(&ids(&["a", "b"])), 0);
        assert_eq!(roster.len(), 2);

        // Ein erweiterter Schnappschuss ergänzt nur die neue ID
        assert_eq!(roster.merge_snapshot(&ids(&["a", "b", "c"])), 1);
        assert_eq!(roster.len(), 3);
    }

    #[test]
    fn test_snapshot_does_not_remove_missing_entries() {
        let roster = Roster::new();
        roster.merge_snapshot(&ids(&["a", "b"]));

        // "b" fehlt im Schnappschuss, bleibt aber bis zur expliziten Abmeldung
        roster.merge_snapshot(&ids(&["a"]));
        assert!(roster.contains(&ParticipantId::from("b")));
    }

    #[test]
    fn test_departure_of_unknown_id_is_a_noop() {
        let roster = Roster::new();
        roster.merge_snapshot(&ids(&["a"]));

        assert!(!roster.remove(&ParticipantId::from("ghost")));
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_departure_removes_entry_and_emits_event() {
        let roster = Roster::new();
        let mut events = roster.subscribe();
        roster.merge_snapshot(&ids(&["a"]));

        assert!(roster.remove(&ParticipantId::from("a")));
        assert!(roster.is_empty());

        assert!(matches!(
            events.try_recv().unwrap(),
            RosterEvent::Joined(_)
        ));
        assert!(matches!(events.try_recv().unwrap(), RosterEvent::Left(_)));
    }
}
