//! Peer Link - Abstraktion über die Plattform-Peer-Connection
//!
//! `PeerLink` kapselt genau die Primitive, die die Verhandlung benötigt:
//! Offer/Answer erzeugen, Descriptions anwenden, auf die Kandidaten-Suche
//! warten. Die Produktiv-Implementierung wrappt webrtc-rs; Tests injizieren
//! eigene Implementierungen über `LinkFactory`.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::session::{DescriptionKind, SessionDescription};
use crate::media::{MediaCapture, SAMPLE_RATE};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("no local description available")]
    MissingLocalDescription,

    #[error("unsupported description type: {0}")]
    UnsupportedDescription(String),
}

// ============================================================================
// TRAIT SEAMS
// ============================================================================

/// Verhandlungs-Primitive einer Peer-Connection
pub trait PeerLink: Send + Sync {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>>;

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>>;

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>>;

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>>;

    /// Wartet, bis die Kandidaten-Suche abgeschlossen ist
    ///
    /// Kehrt sofort zurück, wenn das Gathering bereits abgeschlossen war;
    /// ansonsten wird auf die Zustandsänderung gewartet, nie auf eine Frist.
    fn wait_candidates_gathered(&self) -> BoxFuture<'_, Result<(), PeerError>>;

    /// Finalisierte Local-Description inklusive gesammelter Kandidaten
    fn local_description(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Erzeugt pro Anrufversuch einen frischen Link
pub trait LinkFactory: Send + Sync {
    fn create_link(&self) -> BoxFuture<'_, Result<Arc<dyn PeerLink>, PeerError>>;
}

// ============================================================================
// WEBRTC LINK
// ============================================================================

/// PeerLink über eine webrtc-rs Peer-Connection
pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcLink {
    fn to_platform(desc: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
        match desc.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
            DescriptionKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
        }
        .map_err(|e| PeerError::InvalidSdp(e.to_string()))
    }

    fn from_platform(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => DescriptionKind::Offer,
            RTCSdpType::Answer | RTCSdpType::Pranswer => DescriptionKind::Answer,
            other => return Err(PeerError::UnsupportedDescription(other.to_string())),
        };
        Ok(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }
}

impl PeerLink for WebRtcLink {
    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>> {
        Box::pin(async move {
            let offer = self
                .pc
                .create_offer(None)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?;
            Self::from_platform(offer)
        })
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>> {
        Box::pin(async move {
            let answer = self
                .pc
                .create_answer(None)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?;
            Self::from_platform(answer)
        })
    }

    fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>> {
        Box::pin(async move {
            let platform = Self::to_platform(&desc)?;
            self.pc
                .set_local_description(platform)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))
        })
    }

    fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> BoxFuture<'_, Result<(), PeerError>> {
        Box::pin(async move {
            let platform = Self::to_platform(&desc)?;
            self.pc
                .set_remote_description(platform)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))
        })
    }

    fn wait_candidates_gathered(&self) -> BoxFuture<'_, Result<(), PeerError>> {
        Box::pin(async move {
            let mut done = self.pc.gathering_complete_promise().await;
            let _ = done.recv().await;
            Ok(())
        })
    }

    fn local_description(&self) -> BoxFuture<'_, Result<SessionDescription, PeerError>> {
        Box::pin(async move {
            let desc = self
                .pc
                .local_description()
                .await
                .ok_or(PeerError::MissingLocalDescription)?;
            Self::from_platform(desc)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(e) = self.pc.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        })
    }
}

// ============================================================================
// WEBRTC LINK FACTORY
// ============================================================================

/// Baut frische webrtc-rs Links mit ICE-Konfiguration und lokalem Audio-Track
pub struct WebRtcLinkFactory {
    ice_servers: Vec<RTCIceServer>,
    media: Arc<Mutex<Option<MediaCapture>>>,
}

impl WebRtcLinkFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>, media: Arc<Mutex<Option<MediaCapture>>>) -> Self {
        Self { ice_servers, media }
    }

    async fn build_link(&self) -> Result<Arc<dyn PeerLink>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?,
        );

        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", state);
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _, _| {
            Box::pin(async move {
                tracing::info!("Remote track received: {:?}", track.codec());
            })
        }));

        // Lokaler Audio-Track nur, wenn Medien beschafft werden konnten;
        // ohne Medien wird trotzdem verhandelt, der Stream ist dann leer
        if self.media.lock().is_some() {
            let audio_track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: SAMPLE_RATE,
                    channels: 1,
                    ..Default::default()
                },
                "audio".to_string(),
                "visavis".to_string(),
            ));

            pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        }

        Ok(Arc::new(WebRtcLink { pc }))
    }
}

impl LinkFactory for WebRtcLinkFactory {
    fn create_link(&self) -> BoxFuture<'_, Result<Arc<dyn PeerLink>, PeerError>> {
        Box::pin(self.build_link())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_without_media_can_create_offer() {
        let media = Arc::new(Mutex::new(None));
        let factory = WebRtcLinkFactory::new(Vec::new(), media);

        let link = factory.create_link().await.unwrap();
        let offer = link.create_offer().await.unwrap();

        assert_eq!(offer.kind, DescriptionKind::Offer);
        assert!(!offer.sdp.is_empty());

        link.close().await;
    }

    #[tokio::test]
    async fn test_local_description_before_apply_is_an_error() {
        let factory = WebRtcLinkFactory::new(Vec::new(), Arc::new(Mutex::new(None)));
        let link = factory.create_link().await.unwrap();

        let err = link.local_description().await.unwrap_err();
        assert!(matches!(err, PeerError::MissingLocalDescription));

        link.close().await;
    }
}
