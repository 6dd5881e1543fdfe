//! Media Module - Lokale Audio-Beschaffung
//!
//! Dieses Modul verwaltet:
//! - Audio Capture (Mikrofon) und Playback (Lautsprecher) über cpal
//! - Mute und Pegel-Messung
//!
//! Ein Fehlschlag beim Beschaffen degradiert still: die Verhandlung läuft
//! dann ohne lokalen Stream weiter.

mod capture;

pub use capture::{MediaCapture, MediaError, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
