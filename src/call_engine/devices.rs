//! Geräteverwaltung
//!
//! Listet Mikrofone und Kameras auf, hält die aktuelle Auswahl und öffnet
//! Tracks über den `MediaDevices` Trait. Das Öffnen selbst läuft als
//! `Acquisition` auf einem eigenen Task, damit die Call Engine währenddessen
//! weiter Events verarbeitet.

use super::track::{LocalTrack, TrackKind};
use super::state::MediaKind;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Geräte-ID, die der Host für sein Standardgerät vergibt
pub const DEFAULT_DEVICE_ID: &str = "default";

const FRONT_LABELS: [&str; 2] = ["front", "user"];
const BACK_LABELS: [&str; 3] = ["back", "environment", "rear"];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No usable media device")]
    NoDevice,

    #[error("Permission to use media devices denied")]
    PermissionDenied,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Not supported: {0}")]
    Unsupported(String),
}

// ============================================================================
// DEVICE TYPES
// ============================================================================

/// Ein Eingabegerät
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaDeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: TrackKind,
}

/// Ausgewählte Geräte
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceSelection {
    pub audio_device_id: Option<String>,
    pub video_device_id: Option<String>,
}

impl DeviceSelection {
    pub fn get(&self, kind: TrackKind) -> Option<&str> {
        match kind {
            TrackKind::Audio => self.audio_device_id.as_deref(),
            TrackKind::Video => self.video_device_id.as_deref(),
        }
    }

    fn set(&mut self, kind: TrackKind, id: Option<String>) {
        match kind {
            TrackKind::Audio => self.audio_device_id = id,
            TrackKind::Video => self.video_device_id = id,
        }
    }
}

/// Bekannte Geräte samt Auswahl
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceList {
    pub audio: Vec<MediaDeviceInfo>,
    pub video: Vec<MediaDeviceInfo>,
    pub selection: DeviceSelection,
}

impl DeviceList {
    pub fn devices(&self, kind: TrackKind) -> &[MediaDeviceInfo] {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && self.video.is_empty()
    }
}

/// Ausrichtung einer Kamera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

/// Was beim Öffnen eines Tracks angefordert wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackConstraints {
    pub kind: TrackKind,
    pub device_id: Option<String>,
    pub facing: Option<FacingMode>,
}

impl TrackConstraints {
    pub fn device(kind: TrackKind, device_id: Option<String>) -> Self {
        Self {
            kind,
            device_id,
            facing: None,
        }
    }

    pub fn facing(facing: FacingMode) -> Self {
        Self {
            kind: TrackKind::Video,
            device_id: None,
            facing: Some(facing),
        }
    }
}

// ============================================================================
// PLATFORM INTERFACE
// ============================================================================

/// Zugriff auf die Capture-Hardware der Plattform
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Listet alle Eingabegeräte (Labels können ohne Berechtigung leer sein)
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, DeviceError>;

    /// Kurzer Zugriff auf alle Geräte, damit Labels verfügbar werden
    async fn probe_permissions(&self) -> Result<(), DeviceError>;

    /// Öffnet einen Track passend zu den Constraints
    async fn open(&self, constraints: TrackConstraints) -> Result<LocalTrack, DeviceError>;

    /// Öffnet eine Bildschirmaufnahme (Auswahl-Dialog der Plattform)
    async fn open_display(&self) -> Result<LocalTrack, DeviceError>;
}

// ============================================================================
// ACQUISITION
// ============================================================================

/// Ein geplanter Satz von Tracks, der außerhalb der Engine geöffnet wird
pub struct Acquisition {
    devices: Arc<dyn MediaDevices>,
    plan: Vec<TrackConstraints>,
}

impl Acquisition {
    pub fn plan(&self) -> &[TrackConstraints] {
        &self.plan
    }

    /// Öffnet alle Tracks; schlägt einer fehl, werden die bereits
    /// geöffneten wieder gestoppt
    pub async fn run(self) -> Result<Vec<LocalTrack>, DeviceError> {
        let mut tracks = Vec::with_capacity(self.plan.len());

        for constraints in self.plan {
            let kind = constraints.kind;
            match self.devices.open(constraints).await {
                Ok(track) => {
                    tracing::info!("Opened {:?} track: {}", kind, track.label());
                    tracks.push(track);
                }
                Err(e) => {
                    tracing::error!("Failed to open {:?} track: {}", kind, e);
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        Ok(tracks)
    }
}

// ============================================================================
// DEVICE MANAGER
// ============================================================================

/// Ergebnis eines geplanten Kamerawechsels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacingSwitch {
    pub constraints: TrackConstraints,
    pub facing: FacingMode,
}

pub struct DeviceManager {
    devices: Arc<dyn MediaDevices>,
    list: DeviceList,
    facing: FacingMode,
}

impl DeviceManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            list: DeviceList::default(),
            facing: FacingMode::User,
        }
    }

    pub fn list(&self) -> &DeviceList {
        &self.list
    }

    pub fn platform(&self) -> Arc<dyn MediaDevices> {
        Arc::clone(&self.devices)
    }

    /// Liest die Geräte neu ein
    ///
    /// Fehlen Labels, wird vorher kurz auf alle Geräte zugegriffen. Eine
    /// gültige Auswahl bleibt erhalten, sonst wird das Standardgerät gewählt.
    pub async fn refresh(&mut self) -> Result<&DeviceList, DeviceError> {
        let mut found = self.devices.enumerate().await?;

        if found.iter().any(|d| d.label.is_empty()) {
            match self.devices.probe_permissions().await {
                Ok(()) => found = self.devices.enumerate().await?,
                Err(e) => tracing::warn!("Permission probe failed, device labels stay limited: {}", e),
            }
        }

        let (audio, video): (Vec<_>, Vec<_>) =
            found.into_iter().partition(|d| d.kind == TrackKind::Audio);

        let mut selection = DeviceSelection::default();
        for (kind, devices) in [(TrackKind::Audio, &audio), (TrackKind::Video, &video)] {
            let current = self
                .list
                .selection
                .get(kind)
                .filter(|id| devices.iter().any(|d| d.id == *id))
                .map(str::to_string);
            selection.set(kind, current.or_else(|| Self::default_device(devices)));
        }

        tracing::info!(
            "Devices refreshed: {} audio, {} video (selected {:?} / {:?})",
            audio.len(),
            video.len(),
            selection.audio_device_id,
            selection.video_device_id
        );

        self.list = DeviceList {
            audio,
            video,
            selection,
        };
        Ok(&self.list)
    }

    /// Plant die Tracks für einen Anruf
    ///
    /// Audio wird angefragt, wenn ein Mikrofon existiert, Video nur bei
    /// Videoanrufen mit Kamera.
    pub fn acquisition(&self, media_kind: MediaKind) -> Result<Acquisition, DeviceError> {
        let mut plan = Vec::new();

        if !self.list.audio.is_empty() {
            plan.push(TrackConstraints::device(
                TrackKind::Audio,
                self.list.selection.audio_device_id.clone(),
            ));
        }
        if media_kind.is_video() && !self.list.video.is_empty() {
            plan.push(TrackConstraints::device(
                TrackKind::Video,
                self.list.selection.video_device_id.clone(),
            ));
        }

        if plan.is_empty() {
            return Err(DeviceError::NoDevice);
        }

        Ok(Acquisition {
            devices: Arc::clone(&self.devices),
            plan,
        })
    }

    /// Plant einen Gerätewechsel; unbekannte IDs werden abgelehnt
    pub fn switch_to(&self, kind: TrackKind, device_id: &str) -> Result<Acquisition, DeviceError> {
        if !self.list.devices(kind).iter().any(|d| d.id == device_id) {
            return Err(DeviceError::NotFound(device_id.to_string()));
        }

        Ok(Acquisition {
            devices: Arc::clone(&self.devices),
            plan: vec![TrackConstraints::device(kind, Some(device_id.to_string()))],
        })
    }

    /// Übernimmt eine Auswahl nachdem der neue Track läuft
    pub fn commit_selection(&mut self, kind: TrackKind, device_id: Option<String>) {
        self.list.selection.set(kind, device_id);
    }

    /// Plant den Wechsel zwischen Front- und Rückkamera
    ///
    /// Sind beide Kameras am Label erkennbar, wird direkt zwischen ihnen
    /// gewechselt, sonst wird die jeweils andere Ausrichtung angefordert.
    pub fn facing_switch(&self) -> FacingSwitch {
        let find = |labels: &[&str]| {
            self.list.video.iter().find(|d| {
                let label = d.label.to_lowercase();
                labels.iter().any(|l| label.contains(l))
            })
        };

        if let (Some(front), Some(back)) = (find(&FRONT_LABELS), find(&BACK_LABELS)) {
            let current = self.list.selection.video_device_id.as_deref();
            let (target, facing) = if current == Some(front.id.as_str()) {
                (back, FacingMode::Environment)
            } else {
                (front, FacingMode::User)
            };
            return FacingSwitch {
                constraints: TrackConstraints::device(TrackKind::Video, Some(target.id.clone())),
                facing,
            };
        }

        let facing = self.facing.opposite();
        FacingSwitch {
            constraints: TrackConstraints::facing(facing),
            facing,
        }
    }

    /// Übernimmt einen erfolgreichen Kamerawechsel
    pub fn commit_facing(&mut self, facing: FacingMode, device_id: Option<String>) {
        self.facing = facing;
        if device_id.is_some() {
            self.list.selection.video_device_id = device_id;
        }
    }

    /// Standard: Gerät mit ID "default", sonst das erste
    fn default_device(devices: &[MediaDeviceInfo]) -> Option<String> {
        devices
            .iter()
            .find(|d| d.id == DEFAULT_DEVICE_ID)
            .or_else(|| devices.first())
            .map(|d| d.id.clone())
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("list", &self.list)
            .field("facing", &self.facing)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::{device, FakeDevices};

    fn manager(devices: Vec<MediaDeviceInfo>) -> (DeviceManager, Arc<FakeDevices>) {
        let fake = Arc::new(FakeDevices::new(devices));
        (DeviceManager::new(fake.clone()), fake)
    }

    #[tokio::test]
    async fn test_default_device_preferred() {
        let (mut manager, _) = manager(vec![
            device("mic-usb", "USB Mic", TrackKind::Audio),
            device("default", "Default", TrackKind::Audio),
            device("cam-1", "Integrated Camera", TrackKind::Video),
        ]);

        let list = manager.refresh().await.unwrap();
        assert_eq!(list.selection.audio_device_id.as_deref(), Some("default"));
        assert_eq!(list.selection.video_device_id.as_deref(), Some("cam-1"));
    }

    #[tokio::test]
    async fn test_probe_when_labels_missing() {
        let (mut manager, fake) = manager(vec![device("mic-1", "", TrackKind::Audio)]);
        fake.set_labels_after_probe(vec![device("mic-1", "Headset", TrackKind::Audio)]);

        let list = manager.refresh().await.unwrap();
        assert_eq!(fake.probe_count(), 1);
        assert_eq!(list.audio[0].label, "Headset");
    }

    #[tokio::test]
    async fn test_refresh_keeps_valid_selection() {
        let (mut manager, _) = manager(vec![
            device("default", "Default", TrackKind::Audio),
            device("mic-2", "Headset", TrackKind::Audio),
        ]);
        manager.refresh().await.unwrap();
        manager.commit_selection(TrackKind::Audio, Some("mic-2".to_string()));

        let list = manager.refresh().await.unwrap();
        assert_eq!(list.selection.audio_device_id.as_deref(), Some("mic-2"));
    }

    #[tokio::test]
    async fn test_acquisition_plan_by_media_kind() {
        let (mut manager, _) = manager(vec![
            device("mic-1", "Mic", TrackKind::Audio),
            device("cam-1", "Cam", TrackKind::Video),
        ]);
        manager.refresh().await.unwrap();

        assert_eq!(manager.acquisition(MediaKind::Audio).unwrap().plan().len(), 1);
        let video = manager.acquisition(MediaKind::Video).unwrap();
        assert_eq!(video.plan()[1].device_id.as_deref(), Some("cam-1"));
    }

    #[tokio::test]
    async fn test_no_device() {
        let (mut manager, _) = manager(vec![device("cam-1", "Cam", TrackKind::Video)]);
        manager.refresh().await.unwrap();

        assert!(matches!(
            manager.acquisition(MediaKind::Audio),
            Err(DeviceError::NoDevice)
        ));
        assert!(manager.acquisition(MediaKind::Video).is_ok());
    }

    #[tokio::test]
    async fn test_partial_open_failure_stops_opened_tracks() {
        let (mut manager, fake) = manager(vec![
            device("mic-1", "Mic", TrackKind::Audio),
            device("cam-1", "Cam", TrackKind::Video),
        ]);
        manager.refresh().await.unwrap();
        fake.fail_kind(TrackKind::Video, DeviceError::Hardware("busy".to_string()));

        let result = manager.acquisition(MediaKind::Video).unwrap().run().await;
        assert_eq!(result.unwrap_err(), DeviceError::Hardware("busy".to_string()));

        let opened = fake.opened();
        assert_eq!(opened.len(), 1);
        assert!(opened[0].is_stopped());
    }

    #[tokio::test]
    async fn test_switch_to_unknown_device() {
        let (mut manager, _) = manager(vec![device("mic-1", "Mic", TrackKind::Audio)]);
        manager.refresh().await.unwrap();

        assert!(matches!(
            manager.switch_to(TrackKind::Audio, "mic-9"),
            Err(DeviceError::NotFound(_))
        ));
        assert!(manager.switch_to(TrackKind::Audio, "mic-1").is_ok());
    }

    #[tokio::test]
    async fn test_facing_switch_by_label() {
        let (mut manager, _) = manager(vec![
            device("cam-front", "Front Camera", TrackKind::Video),
            device("cam-back", "Back Camera", TrackKind::Video),
        ]);
        manager.refresh().await.unwrap();

        let switch = manager.facing_switch();
        assert_eq!(switch.facing, FacingMode::Environment);
        assert_eq!(switch.constraints.device_id.as_deref(), Some("cam-back"));

        manager.commit_facing(switch.facing, switch.constraints.device_id);
        let back = manager.facing_switch();
        assert_eq!(back.constraints.device_id.as_deref(), Some("cam-front"));
    }

    #[tokio::test]
    async fn test_facing_switch_by_constraint() {
        let (mut manager, _) = manager(vec![device("cam-1", "HD Webcam", TrackKind::Video)]);
        manager.refresh().await.unwrap();

        let switch = manager.facing_switch();
        assert_eq!(switch.constraints, TrackConstraints::facing(FacingMode::Environment));

        manager.commit_facing(switch.facing, None);
        assert_eq!(manager.facing_switch().facing, FacingMode::User);
        assert_eq!(manager.list().selection.video_device_id.as_deref(), Some("cam-1"));
    }
}
