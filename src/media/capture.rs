//! Media Capture - Mikrofon und Lautsprecher
//!
//! Beschafft die lokalen Medien über cpal. Ein Aufruf liefert einen
//! laufenden Capture/Playback-Handle oder einen Fehler, den der Aufrufer
//! nur protokolliert - die Verhandlung läuft dann ohne lokalen Stream.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Kapazität der Audio-Ring-Buffer
const RING_CAPACITY: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("no audio input device found")]
    NoInputDevice,

    #[error("no audio output device found")]
    NoOutputDevice,

    #[error("unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("failed to start audio stream: {0}")]
    StreamStart(String),
}

// ============================================================================
// MEDIA CAPTURE
// ============================================================================

/// Laufende lokale Medien (Capture + Playback)
pub struct MediaCapture {
    // Die Streams leben so lange wie der Handle; Drop beendet sie
    _input_stream: Stream,
    _output_stream: Stream,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_ring: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für abzuspielendes Audio (decoded PCM)
    playback_ring: Arc<Mutex<HeapRb<f32>>>,

    muted: Arc<Mutex<bool>>,

    /// Pegel (0.0 - 1.0) für die Visualisierung
    input_level: Arc<Mutex<f32>>,
    output_level: Arc<Mutex<f32>>,
}

// Stream ist nicht Send; der Handle wandert aber zwischen Tasks und wird
// nur hinter einem Mutex angefasst
unsafe impl Send for MediaCapture {}

impl MediaCapture {
    /// Öffnet die Default-Geräte und startet Capture und Playback
    pub fn acquire() -> Result<Self, MediaError> {
        let host = cpal::default_host();

        let input = host
            .default_input_device()
            .ok_or(MediaError::NoInputDevice)?;
        let output = host
            .default_output_device()
            .ok_or(MediaError::NoOutputDevice)?;

        let capture_ring = Arc::new(Mutex::new(HeapRb::new(RING_CAPACITY)));
        let playback_ring = Arc::new(Mutex::new(HeapRb::new(RING_CAPACITY)));
        let muted = Arc::new(Mutex::new(false));
        let input_level = Arc::new(Mutex::new(0.0));
        let output_level = Arc::new(Mutex::new(0.0));

        let input_stream = Self::start_capture(&input, &capture_ring, &muted, &input_level)?;
        let output_stream = Self::start_playback(&output, &playback_ring, &output_level)?;

        tracing::info!(
            "Local media acquired: {} Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(Self {
            _input_stream: input_stream,
            _output_stream: output_stream,
            capture_ring,
            playback_ring,
            muted,
            input_level,
            output_level,
        })
    }

    /// Liest einen Frame aufgenommenes Audio (falls genug vorliegt)
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut ring = self.capture_ring.lock();
        if ring.occupied_len() < FRAME_SIZE {
            return None;
        }

        let mut frame = Vec::with_capacity(FRAME_SIZE);
        for _ in 0..FRAME_SIZE {
            if let Some(sample) = ring.try_pop() {
                frame.push(sample);
            }
        }
        Some(frame)
    }

    /// Schreibt empfangene Samples in den Playback-Buffer
    pub fn write_samples(&self, samples: &[f32]) {
        let mut ring = self.playback_ring.lock();
        for sample in samples {
            let _ = ring.try_push(*sample);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        *self.muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.lock()
    }

    /// Gibt die Pegel zurück (input, output)
    pub fn levels(&self) -> (f32, f32) {
        (*self.input_level.lock(), *self.output_level.lock())
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn start_capture(
        device: &Device,
        ring: &Arc<Mutex<HeapRb<f32>>>,
        muted: &Arc<Mutex<bool>>,
        level: &Arc<Mutex<f32>>,
    ) -> Result<Stream, MediaError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;
        let config = Self::pick_config(configs.collect())?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let ring = Arc::clone(ring);
        let muted = Arc::clone(muted);
        let level = Arc::clone(level);
        let source_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Pegel als RMS
                    let rms =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len().max(1) as f32).sqrt();
                    *level.lock() = rms.min(1.0);

                    if *muted.lock() {
                        return;
                    }

                    let samples = resample(data, source_rate, SAMPLE_RATE);
                    let mut ring = ring.lock();
                    for sample in samples {
                        let _ = ring.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::StreamStart(e.to_string()))?;

        Ok(stream)
    }

    fn start_playback(
        device: &Device,
        ring: &Arc<Mutex<HeapRb<f32>>>,
        level: &Arc<Mutex<f32>>,
    ) -> Result<Stream, MediaError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?;
        let config = Self::pick_config(configs.collect())?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let ring = Arc::clone(ring);
        let level = Arc::clone(level);
        let channels = config.channels as usize;
        let target_rate = config.sample_rate.0;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut ring = ring.lock();
                    let frames = data.len() / channels.max(1);
                    let ratio = SAMPLE_RATE as f32 / target_rate as f32;

                    // Mono-Quelle auf alle Kanäle verteilen; bei abweichender
                    // Rate werden Quell-Samples über einen Schrittzähler
                    // gezogen bzw. gehalten
                    let mut step = 0.0f32;
                    let mut current = 0.0f32;
                    let mut level_sum = 0.0f32;

                    for i in 0..frames {
                        step += ratio;
                        while step >= 1.0 {
                            current = ring.try_pop().unwrap_or(0.0);
                            step -= 1.0;
                        }
                        level_sum += current.abs();
                        for c in 0..channels {
                            if let Some(slot) = data.get_mut(i * channels + c) {
                                *slot = current;
                            }
                        }
                    }

                    if frames > 0 {
                        *level.lock() = (level_sum / frames as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::StreamBuild(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::StreamStart(e.to_string()))?;

        Ok(stream)
    }

    /// Wählt die beste Konfiguration: 48kHz und F32 bevorzugt
    fn pick_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, MediaError> {
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                return Ok(config.with_max_sample_rate().into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::UnsupportedConfig(
            "no suitable audio configuration found".to_string(),
        ))
    }
}

// ============================================================================
// RESAMPLING
// ============================================================================

/// Lineares Resampling auf die Ziel-Rate
fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;

    (0..new_len)
        .map(|i| {
            let src = i as f32 / ratio;
            let idx = src as usize;
            let frac = src - idx as f32;
            let a = data.get(idx).copied().unwrap_or(0.0);
            let b = data.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_is_identity_for_equal_rates() {
        let data = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&data, 48000, 48000), data);
    }

    #[test]
    fn test_resample_doubles_length_when_upsampling() {
        let data = vec![0.0, 1.0, 0.0, -1.0];
        let out = resample(&data, 24000, 48000);
        assert_eq!(out.len(), data.len() * 2);
        // Interpolierte Zwischenwerte liegen zwischen den Stützstellen
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_halves_length_when_downsampling() {
        let data = vec![0.0; 960];
        let out = resample(&data, 96000, 48000);
        assert_eq!(out.len(), 480);
    }
}
