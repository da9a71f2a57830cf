//! Transport-Sitzung über einer Peer Connection
//!
//! `PeerTransport` ist die schmale Schnittstelle zur eigentlichen Peer
//! Connection (WebRTC in `rtc.rs`, Fakes in Tests). `TransportSession` führt
//! darüber Buch, welcher lokale Track über welchen Sender läuft, und
//! kümmert sich um Austausch, Bildschirmfreigabe und das Schließen.

use super::track::{LocalTrack, RemoteTrackInfo, TrackKind, TrackOrigin};
use crate::config::CallConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to create peer connection: {0}")]
    CreateFailed(String),

    #[error("Invalid session description: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Track operation failed: {0}")]
    Track(String),

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Transport already closed")]
    Closed,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Verbindungsstatus der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Was die Peer Connection der Engine meldet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Neuer lokaler ICE Candidate (JSON)
    LocalCandidate(String),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrackInfo),
}

/// Rückkanal für Transport-Events
#[derive(Clone)]
pub struct TransportEvents {
    sink: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportEvents {
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self { sink: Arc::new(sink) }
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(event);
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransportEvents")
    }
}

// ============================================================================
// PEER TRANSPORT
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Kennung eines ausgehenden Senders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Die Peer Connection, wie die Call Engine sie sieht
///
/// Descriptions und Candidates werden als JSON-Strings übergeben, so wie
/// sie auch über das Signaling laufen.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, TransportError>;

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), TransportError>;

    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError>;

    /// Erstellt ein Offer, setzt es lokal und gibt es zurück
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Erstellt ein Answer, setzt es lokal und gibt es zurück
    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_remote_description(&self, kind: SdpKind, payload: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, payload: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erzeugt eine Peer Connection pro Session
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &CallConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

// ============================================================================
// TRANSPORT SESSION
// ============================================================================

struct Outgoing {
    track: LocalTrack,
    sender: SenderId,
}

/// Lokale Tracks und Remote-Status einer Peer Connection
pub struct TransportSession {
    peer: Arc<dyn PeerTransport>,
    audio: Option<Outgoing>,
    video: Option<Outgoing>,
    remote_tracks: Vec<RemoteTrackInfo>,
    has_remote_description: bool,
    closed: bool,
}

impl TransportSession {
    pub fn new(peer: Arc<dyn PeerTransport>) -> Self {
        Self {
            peer,
            audio: None,
            video: None,
            remote_tracks: Vec::new(),
            has_remote_description: false,
            closed: false,
        }
    }

    fn slot(&mut self, kind: TrackKind) -> &mut Option<Outgoing> {
        match kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        }
    }

    /// Aktuell gesendeter Track einer Art
    pub fn local_track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
        .map(|o| &o.track)
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.video
            .as_ref()
            .is_some_and(|o| o.track.origin() == TrackOrigin::Screen)
    }

    /// Fügt einen lokalen Track als neuen Sender hinzu
    ///
    /// Bei Fehler bleibt der Track in der Verantwortung des Aufrufers.
    pub async fn add_local_track(&mut self, track: LocalTrack) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let sender = self.peer.add_track(&track).await?;
        tracing::debug!("Added local {:?} track {} as {:?}", track.kind(), track.id(), sender);

        if let Some(previous) = self.slot(track.kind()).replace(Outgoing { track, sender }) {
            previous.track.stop();
        }
        Ok(())
    }

    /// Tauscht den gesendeten Track gleicher Art ohne Neuverhandlung aus
    ///
    /// Gibt es noch keinen passenden Sender, wird der Track hinzugefügt. Der
    /// alte Track wird gestoppt; schlägt der Austausch fehl, wird der neue
    /// gestoppt und der alte bleibt aktiv.
    pub async fn replace_track(&mut self, track: LocalTrack) -> Result<(), TransportError> {
        if self.closed {
            track.stop();
            return Err(TransportError::Closed);
        }

        let kind = track.kind();
        let Some(sender) = self.slot(kind).as_ref().map(|o| o.sender) else {
            tracing::info!("No outgoing {:?} sender, adding track instead", kind);
            return match self.add_local_track(track.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    track.stop();
                    Err(e)
                }
            };
        };

        // Neuer Track erbt den Mute-Status des alten
        if let Some(current) = self.local_track(kind) {
            track.set_enabled(current.is_enabled());
        }

        if let Err(e) = self.peer.replace_track(sender, &track).await {
            tracing::error!("Failed to replace {:?} track: {}", kind, e);
            track.stop();
            return Err(e);
        }

        if let Some(previous) = self.slot(kind).replace(Outgoing { track, sender }) {
            previous.track.stop();
        }
        tracing::info!("Replaced outgoing {:?} track", kind);
        Ok(())
    }

    /// Entfernt den Sender einer Art und stoppt dessen Track
    pub async fn remove_track(&mut self, kind: TrackKind) -> Result<(), TransportError> {
        let Some(outgoing) = self.slot(kind).take() else {
            return Ok(());
        };
        outgoing.track.stop();
        self.peer.remove_track(outgoing.sender).await
    }

    /// Schaltet einen ausgehenden Track stumm oder wieder an
    ///
    /// Gibt den neuen Status zurück oder `None`, wenn kein Track dieser Art
    /// gesendet wird.
    pub fn toggle_enabled(&self, kind: TrackKind) -> Option<bool> {
        let track = self.local_track(kind)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::debug!("{:?} track enabled: {}", kind, enabled);
        Some(enabled)
    }

    // ========================================================================
    // SDP / ICE
    // ========================================================================

    pub async fn create_offer(&self) -> Result<String, TransportError> {
        self.peer.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<String, TransportError> {
        self.peer.create_answer().await
    }

    pub async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        payload: &str,
    ) -> Result<(), TransportError> {
        self.peer.set_remote_description(kind, payload).await?;
        self.has_remote_description = true;
        Ok(())
    }

    /// Wendet einen Remote Candidate an
    ///
    /// Ohne Remote Description wird er verworfen (`Ok(false)`).
    pub async fn add_remote_candidate(&self, payload: &str) -> Result<bool, TransportError> {
        if !self.has_remote_description {
            tracing::debug!("Dropping remote candidate, no remote description yet");
            return Ok(false);
        }
        self.peer.add_remote_candidate(payload).await?;
        Ok(true)
    }

    pub fn remote_track_arrived(&mut self, info: RemoteTrackInfo) {
        tracing::info!("Remote {:?} track available: {}", info.kind, info.id);
        self.remote_tracks.push(info);
    }

    /// Stoppt alle Tracks und schließt die Peer Connection
    ///
    /// Mehrfach aufrufbar; Fehler beim Schließen werden nur geloggt.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for outgoing in [self.audio.take(), self.video.take()].into_iter().flatten() {
            outgoing.track.stop();
        }
        self.remote_tracks.clear();

        if let Err(e) = self.peer.close().await {
            tracing::warn!("Error while closing peer connection: {}", e);
        }
        tracing::info!("Transport session closed");
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("audio", &self.local_track(TrackKind::Audio))
            .field("video", &self.local_track(TrackKind::Video))
            .field("remote_tracks", &self.remote_tracks)
            .field("has_remote_description", &self.has_remote_description)
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{test_track, FakePeer, PeerOp};

    fn session() -> (TransportSession, Arc<FakePeer>) {
        let peer = Arc::new(FakePeer::default());
        (TransportSession::new(peer.clone()), peer)
    }

    #[tokio::test]
    async fn test_replace_swaps_sender_track_and_stops_old() {
        let (mut session, peer) = session();
        let camera_a = test_track(TrackKind::Video, TrackOrigin::Device, "camA");
        let camera_b = test_track(TrackKind::Video, TrackOrigin::Device, "camB");

        session.add_local_track(camera_a.clone()).await.unwrap();
        session.replace_track(camera_b.clone()).await.unwrap();

        assert!(camera_a.is_stopped());
        assert!(!camera_b.is_stopped());
        assert_eq!(session.local_track(TrackKind::Video).unwrap().id(), camera_b.id());
        assert_eq!(
            peer.ops(),
            vec![
                PeerOp::AddTrack(camera_a.id().to_string()),
                PeerOp::ReplaceTrack(SenderId(1), camera_b.id().to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_without_sender_adds_track() {
        let (mut session, peer) = session();
        let mic = test_track(TrackKind::Audio, TrackOrigin::Device, "mic");

        session.replace_track(mic.clone()).await.unwrap();
        assert_eq!(peer.ops(), vec![PeerOp::AddTrack(mic.id().to_string())]);
    }

    #[tokio::test]
    async fn test_failed_replace_keeps_old_track() {
        let (mut session, peer) = session();
        let old = test_track(TrackKind::Audio, TrackOrigin::Device, "mic-1");
        let new = test_track(TrackKind::Audio, TrackOrigin::Device, "mic-2");
        session.add_local_track(old.clone()).await.unwrap();

        peer.fail_replace(true);
        assert!(session.replace_track(new.clone()).await.is_err());
        assert!(new.is_stopped());
        assert!(!old.is_stopped());
        assert_eq!(session.local_track(TrackKind::Audio).unwrap().id(), old.id());
    }

    #[tokio::test]
    async fn test_replacement_inherits_mute() {
        let (mut session, _) = session();
        let old = test_track(TrackKind::Audio, TrackOrigin::Device, "mic-1");
        let new = test_track(TrackKind::Audio, TrackOrigin::Device, "mic-2");
        session.add_local_track(old).await.unwrap();

        assert_eq!(session.toggle_enabled(TrackKind::Audio), Some(false));
        session.replace_track(new.clone()).await.unwrap();
        assert!(!new.is_enabled());
        assert_eq!(session.toggle_enabled(TrackKind::Video), None);
    }

    #[tokio::test]
    async fn test_remote_candidate_needs_remote_description() {
        let (mut session, peer) = session();

        assert!(!session.add_remote_candidate("{}").await.unwrap());
        session
            .set_remote_description(SdpKind::Offer, r#"{"type":"offer","sdp":"x"}"#)
            .await
            .unwrap();
        assert!(session.add_remote_candidate("{}").await.unwrap());

        assert_eq!(
            peer.ops().last(),
            Some(&PeerOp::AddCandidate("{}".to_string()))
        );
    }

    #[tokio::test]
    async fn test_screen_share_flag_follows_origin() {
        let (mut session, _) = session();
        let camera = test_track(TrackKind::Video, TrackOrigin::Device, "cam");
        let screen = test_track(TrackKind::Video, TrackOrigin::Screen, "screen");

        session.add_local_track(camera).await.unwrap();
        assert!(!session.is_screen_sharing());
        session.replace_track(screen.clone()).await.unwrap();
        assert!(session.is_screen_sharing());

        session.remove_track(TrackKind::Video).await.unwrap();
        assert!(screen.is_stopped());
        assert!(!session.is_screen_sharing());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut session, peer) = session();
        let mic = test_track(TrackKind::Audio, TrackOrigin::Device, "mic");
        session.add_local_track(mic.clone()).await.unwrap();

        session.close().await;
        session.close().await;

        assert!(mic.is_stopped());
        assert_eq!(peer.close_count(), 1);
        assert!(matches!(
            session.add_local_track(mic).await,
            Err(TransportError::Closed)
        ));
    }
}
