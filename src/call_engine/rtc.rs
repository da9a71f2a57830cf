//! WebRTC Transport
//!
//! `PeerTransport` Implementierung über `RTCPeerConnection` aus webrtc-rs.
//! Pro Session wird eine Peer Connection mit Default-Codecs, Default-
//! Interceptors und einem Daten-Kanal erzeugt.

use super::track::{LocalTrack, RemoteTrackInfo, TrackKind};
use super::transport::{
    PeerTransport, SdpKind, SenderId, TransportError, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};
use crate::config::CallConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt `RtcPeerTransport`s
#[derive(Debug, Clone, Default)]
pub struct RtcTransportFactory;

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &CallConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = RtcPeerTransport::new(config, events).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
    data_channel: Option<Arc<RTCDataChannel>>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl RtcPeerTransport {
    pub async fn new(config: &CallConfig, events: TransportEvents) -> Result<Self, TransportError> {
        // Media Engine mit Standard-Codecs (Opus, VP8, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::CreateFailed(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::CreateFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ice_transport_policy: config.ice_transport_policy.into(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TransportError::CreateFailed(e.to_string()))?,
        );

        Self::register_handlers(&pc, events);

        let data_channel = match pc.create_data_channel(&config.data_channel_label, None).await {
            Ok(channel) => Some(channel),
            Err(e) => {
                tracing::warn!("Failed to open data channel '{}': {}", config.data_channel_label, e);
                None
            }
        };

        tracing::info!("Peer connection created ({} ICE servers)", config.ice_servers.len());

        Ok(Self {
            pc,
            data_channel,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        })
    }

    /// Leitet Connection State, ICE Candidates und Remote Tracks als
    /// `TransportEvent` weiter
    fn register_handlers(pc: &Arc<RTCPeerConnection>, events: TransportEvents) {
        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    TransportState::New
                }
                RTCPeerConnectionState::Connecting => TransportState::Connecting,
                RTCPeerConnectionState::Connected => TransportState::Connected,
                RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                RTCPeerConnectionState::Failed => TransportState::Failed,
                RTCPeerConnectionState::Closed => TransportState::Closed,
            };
            state_events.emit(TransportEvent::StateChanged(state));

            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => candidate_events.emit(TransportEvent::LocalCandidate(json)),
                    Ok(Err(e)) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                    Err(e) => tracing::warn!("Failed to convert ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            events.emit(TransportEvent::RemoteTrack(RemoteTrackInfo {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
            Box::pin(async {})
        }));
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, TransportError> {
        self.senders
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| TransportError::Track(format!("unknown sender {:?}", id)))
    }

    fn parse_description(kind: SdpKind, payload: &str) -> Result<RTCSessionDescription, TransportError> {
        let desc: RTCSessionDescription = serde_json::from_str(payload)
            .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        match (kind, desc.sdp_type) {
            (SdpKind::Offer, RTCSdpType::Offer) => RTCSessionDescription::offer(desc.sdp),
            (SdpKind::Answer, RTCSdpType::Answer) => RTCSessionDescription::answer(desc.sdp),
            (expected, actual) => {
                return Err(TransportError::InvalidSdp(format!(
                    "expected {:?}, got {}",
                    expected, actual
                )))
            }
        }
        .map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, TransportError> {
        let rtp = track.rtp() as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self.pc.add_track(rtp).await.map_err(webrtc_err)?;

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst));
        self.senders.lock().insert(id, sender);
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), TransportError> {
        let sender = self.sender(sender)?;
        let rtp = track.rtp() as Arc<dyn TrackLocal + Send + Sync>;
        sender.replace_track(Some(rtp)).await.map_err(webrtc_err)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError> {
        let removed = self.senders.lock().remove(&sender);
        match removed {
            Some(sender) => self.pc.remove_track(&sender).await.map_err(webrtc_err),
            None => Ok(()),
        }
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        serde_json::to_string(&offer).map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        serde_json::to_string(&answer).map_err(|e| TransportError::InvalidSdp(e.to_string()))
    }

    async fn set_remote_description(&self, kind: SdpKind, payload: &str) -> Result<(), TransportError> {
        let desc = Self::parse_description(kind, payload)?;
        self.pc.set_remote_description(desc).await.map_err(webrtc_err)
    }

    async fn add_remote_candidate(&self, payload: &str) -> Result<(), TransportError> {
        let candidate: RTCIceCandidateInit = serde_json::from_str(payload)
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;
        self.pc.add_ice_candidate(candidate).await.map_err(webrtc_err)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(channel) = &self.data_channel {
            if let Err(e) = channel.close().await {
                tracing::warn!("Failed to close data channel: {}", e);
            }
        }
        self.senders.lock().clear();
        self.pc.close().await.map_err(webrtc_err)
    }
}

impl std::fmt::Debug for RtcPeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtcPeerTransport")
            .field("connection_state", &self.pc.connection_state())
            .field("senders", &self.senders.lock().len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_description_checks_kind() {
        let offer = r#"{"type":"offer","sdp":"v=0\r\n"}"#;

        assert!(matches!(
            RtcPeerTransport::parse_description(SdpKind::Answer, offer),
            Err(TransportError::InvalidSdp(_))
        ));
        assert!(matches!(
            RtcPeerTransport::parse_description(SdpKind::Offer, "not json"),
            Err(TransportError::InvalidSdp(_))
        ));
    }
}
