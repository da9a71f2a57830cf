//! Öffentliche Schnittstelle der Call Engine
//!
//! `CallOrchestrator` ist ein Handle auf einen Engine-Task. Alle Befehle
//! laufen als `Command` über eine Queue und werden dort nacheinander mit
//! Signaling-, Transport- und Timer-Events verarbeitet. Abfragen wie
//! `state()` lesen einen geteilten Snapshot und blockieren nicht.

use super::devices::{DeviceError, DeviceList, MediaDevices};
use super::engine::CallEngine;
use super::presenter::CallPresenter;
use super::rtc::RtcTransportFactory;
use super::state::{CallSession, CallState, MediaKind};
use super::track::{RemoteTrackInfo, TrackKind};
use super::transport::{TransportError, TransportFactory};
use crate::config::CallConfig;
use crate::signaling::{RelayClient, SignalingChannel, SignalingError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Operation not allowed in call state {0:?}")]
    InvalidState(CallState),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call engine is not running")]
    EngineStopped,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für die App
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged { room_id: String, state: CallState },
    RemoteTrackAvailable(RemoteTrackInfo),
    DeviceListChanged(DeviceList),
    /// Gesprächsdauer, einmal pro Sekunde während CONNECTED
    DurationTick(Duration),
    ScreenShareChanged(bool),
    TrackEnabledChanged { kind: TrackKind, enabled: bool },
    Error(String),
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Alles, womit die Engine nach außen wirkt
#[derive(Clone)]
pub struct Collaborators {
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub presenter: Arc<dyn CallPresenter>,
}

// ============================================================================
// COMMANDS & SNAPSHOT
// ============================================================================

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

pub(crate) enum Command {
    Start {
        room_id: String,
        remote_id: String,
        media_kind: MediaKind,
        reply: Reply<String>,
    },
    Incoming {
        room_id: String,
        remote_id: String,
        media_kind: MediaKind,
        reply: Reply<()>,
    },
    Accept {
        reply: Reply<()>,
    },
    Reject {
        reason: String,
        reply: Reply<()>,
    },
    HangUp {
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<bool>,
    },
    ToggleVideo {
        reply: Reply<bool>,
    },
    SwitchDevice {
        kind: TrackKind,
        device_id: String,
        reply: Reply<()>,
    },
    SwitchFacing {
        reply: Reply<()>,
    },
    StartScreenShare {
        reply: Reply<()>,
    },
    StopScreenShare {
        reply: Reply<()>,
    },
    RefreshDevices {
        reply: Reply<DeviceList>,
    },
}

/// Was die Engine für synchrone Abfragen veröffentlicht
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub session: Option<CallSession>,
    pub devices: DeviceList,
    pub connected_at: Option<Instant>,
    pub final_duration: Option<Duration>,
    pub screen_sharing: bool,
}

// ============================================================================
// CALL ORCHESTRATOR
// ============================================================================

pub struct CallOrchestrator {
    commands: mpsc::Sender<Command>,
    shared: Arc<RwLock<Snapshot>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallOrchestrator {
    /// Startet den Engine-Task (benötigt eine laufende Tokio Runtime)
    pub fn new(local_id: impl Into<String>, config: CallConfig, collaborators: Collaborators) -> Self {
        let (commands, command_rx) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(100);
        let shared = Arc::new(RwLock::new(Snapshot::default()));

        // Vor dem Spawn abonnieren, damit keine Nachricht verloren geht
        let inbound = collaborators.signaling.subscribe();

        let engine = CallEngine::new(
            local_id.into(),
            config,
            collaborators,
            internal_tx,
            events.clone(),
            Arc::clone(&shared),
        );
        tokio::spawn(engine.run(command_rx, inbound, internal_rx));

        Self {
            commands,
            shared,
            events,
        }
    }

    /// Verbindet mit dem Relay aus der Konfiguration und nutzt WebRTC als
    /// Transport
    pub async fn connect(
        local_id: impl Into<String>,
        token: Option<&str>,
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        presenter: Arc<dyn CallPresenter>,
    ) -> Result<Self, CallError> {
        let relay = RelayClient::connect(&config.signaling_url, token).await?;
        relay.start_heartbeat(config.heartbeat_interval);

        let collaborators = Collaborators {
            signaling: relay,
            devices,
            transports: Arc::new(RtcTransportFactory),
            presenter,
        };
        Ok(Self::new(local_id, config, collaborators))
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CallError::EngineStopped)?;
        response.await.map_err(|_| CallError::EngineStopped)?
    }

    // ========================================================================
    // CALL CONTROL
    // ========================================================================

    /// Startet einen Anruf in einem neuen Raum; gibt die Raum-ID zurück
    pub async fn start(&self, remote_id: &str, media_kind: MediaKind) -> Result<String, CallError> {
        let room_id = uuid::Uuid::new_v4().to_string();
        self.start_in_room(&room_id, remote_id, media_kind).await
    }

    /// Startet einen Anruf in einem vorgegebenen Raum
    pub async fn start_in_room(
        &self,
        room_id: &str,
        remote_id: &str,
        media_kind: MediaKind,
    ) -> Result<String, CallError> {
        self.request(|reply| Command::Start {
            room_id: room_id.to_string(),
            remote_id: remote_id.to_string(),
            media_kind,
            reply,
        })
        .await
    }

    /// Meldet einen eingehenden Anruf (läuft auch automatisch über den Relay)
    pub async fn on_incoming(
        &self,
        room_id: &str,
        remote_id: &str,
        media_kind: MediaKind,
    ) -> Result<(), CallError> {
        self.request(|reply| Command::Incoming {
            room_id: room_id.to_string(),
            remote_id: remote_id.to_string(),
            media_kind,
            reply,
        })
        .await
    }

    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    pub async fn reject_incoming(&self, reason: &str) -> Result<(), CallError> {
        self.request(|reply| Command::Reject {
            reason: reason.to_string(),
            reply,
        })
        .await
    }

    /// Legt auf; ohne laufenden Anruf passiert nichts
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    // ========================================================================
    // MEDIA CONTROL
    // ========================================================================

    /// Schaltet das Mikrofon stumm; gibt zurück ob jetzt stumm
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Schaltet das ausgehende Video; gibt zurück ob es jetzt gesendet wird
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    pub async fn switch_device(&self, kind: TrackKind, device_id: &str) -> Result<(), CallError> {
        self.request(|reply| Command::SwitchDevice {
            kind,
            device_id: device_id.to_string(),
            reply,
        })
        .await
    }

    pub async fn switch_camera_facing(&self) -> Result<(), CallError> {
        self.request(|reply| Command::SwitchFacing { reply }).await
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StartScreenShare { reply }).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StopScreenShare { reply }).await
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn state(&self) -> CallState {
        self.shared
            .read()
            .session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    pub fn session(&self) -> Option<CallSession> {
        self.shared.read().session.clone()
    }

    pub fn devices(&self) -> DeviceList {
        self.shared.read().devices.clone()
    }

    pub async fn refresh_devices(&self) -> Result<DeviceList, CallError> {
        self.request(|reply| Command::RefreshDevices { reply }).await
    }

    /// Laufende Gesprächsdauer, nach dem Auflegen die Gesamtdauer
    pub fn call_duration(&self) -> Option<Duration> {
        let shared = self.shared.read();
        shared
            .connected_at
            .map(|started| started.elapsed())
            .or(shared.final_duration)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.shared.read().screen_sharing
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for CallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOrchestrator")
            .field("state", &self.state())
            .field("duration", &self.call_duration())
            .finish()
    }
}
