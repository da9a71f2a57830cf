//! Lokale und entfernte Media Tracks
//!
//! Ein `LocalTrack` ist ein günstig klonbarer Handle auf eine Capture-Quelle
//! (Mikrofon, Kamera, Bildschirm) samt dem WebRTC-Track, über den die
//! Samples gesendet werden. `stop()` gibt die Quelle genau einmal frei.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Stream-ID aller lokalen Tracks einer Session
const LOCAL_STREAM_ID: &str = "pulse-call";

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Herkunft eines lokalen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackOrigin {
    Device,
    Screen,
}

/// Die Capture-Quelle hinter einem Track (Stream, Thread, Hardware-Handle)
pub trait TrackSource: Send + Sync {
    /// Gibt die Quelle frei, wird höchstens einmal aufgerufen
    fn stop(&self);

    /// Aktueller Eingangspegel (0.0 - 1.0), falls die Quelle ihn misst
    fn level(&self) -> f32 {
        0.0
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    origin: TrackOrigin,
    label: String,
    device_id: Option<String>,
    enabled: Arc<AtomicBool>,
    stopped: AtomicBool,
    source: Mutex<Option<Box<dyn TrackSource>>>,
    ended: Arc<watch::Sender<bool>>,
    rtp: Arc<TrackLocalStaticSample>,
}

/// Handle auf einen lokal erfassten Track
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        origin: TrackOrigin,
        label: impl Into<String>,
        device_id: Option<String>,
        source: Box<dyn TrackSource>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        let (ended, _) = watch::channel(false);

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                origin,
                label: label.into(),
                device_id,
                enabled: Arc::new(AtomicBool::new(true)),
                stopped: AtomicBool::new(false),
                source: Mutex::new(Some(source)),
                ended: Arc::new(ended),
                rtp,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn origin(&self) -> TrackOrigin {
        self.inner.origin
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    /// Der WebRTC-Track, über den dieser Track gesendet wird
    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    /// Geteiltes Enabled-Flag, das die Capture-Quelle beachtet (Mute)
    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.inner.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn level(&self) -> f32 {
        self.inner
            .source
            .lock()
            .as_ref()
            .map(|s| s.level())
            .unwrap_or(0.0)
    }

    /// Stoppt den Track; weitere Aufrufe sind wirkungslos
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = self.inner.source.lock().take() {
            source.stop();
        }
        self.inner.ended.send_replace(true);
        tracing::debug!("Local {:?} track {} stopped", self.inner.kind, self.inner.id);
    }

    /// Empfänger, der `true` sieht sobald der Track endet
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.inner.ended.subscribe()
    }

    /// Handle für die Quelle, um ein Ende von außen zu melden
    /// (z.B. Bildschirmfreigabe über den System-Dialog beendet)
    pub fn end_signal(&self) -> TrackEndSignal {
        TrackEndSignal {
            ended: Arc::clone(&self.inner.ended),
        }
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("device_id", &self.inner.device_id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Meldet, dass die Quelle eines Tracks von selbst geendet hat
#[derive(Clone)]
pub struct TrackEndSignal {
    ended: Arc<watch::Sender<bool>>,
}

impl TrackEndSignal {
    pub fn signal(&self) {
        self.ended.send_replace(true);
    }
}

/// Metadaten eines empfangenen Tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

// ============================================================================
// TESTS
// ============================================================================
