//! Test-Doubles für Signaling, Geräte, Transport und Presenter

use super::devices::{DeviceError, MediaDeviceInfo, MediaDevices, TrackConstraints};
use super::orchestrator::{CallOrchestrator, Collaborators};
use super::presenter::CallPresenter;
use super::state::CallRole;
use super::track::{LocalTrack, TrackKind, TrackOrigin, TrackSource};
use super::transport::{
    PeerTransport, SdpKind, SenderId, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::config::CallConfig;
use crate::signaling::{
    CallStatus, InboundMessage, OutboundMessage, SignalKind, SignalingChannel, SignalingError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub const FAKE_OFFER: &str = r#"{"type":"offer","sdp":"fake-offer"}"#;
pub const FAKE_ANSWER: &str = r#"{"type":"answer","sdp":"fake-answer"}"#;

pub fn device(id: &str, label: &str, kind: TrackKind) -> MediaDeviceInfo {
    MediaDeviceInfo {
        id: id.to_string(),
        label: label.to_string(),
        kind,
    }
}

pub fn test_track(kind: TrackKind, origin: TrackOrigin, device_id: &str) -> LocalTrack {
    LocalTrack::new(
        kind,
        origin,
        device_id,
        Some(device_id.to_string()),
        Box::new(FakeSource::default()),
    )
}

/// Wartet (durch Abgeben an andere Tasks) bis `condition` gilt
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

// ============================================================================
// TRACK SOURCE
// ============================================================================

#[derive(Default)]
struct FakeSource {
    stops: Arc<AtomicUsize>,
}

impl TrackSource for FakeSource {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// DEVICES
// ============================================================================

#[derive(Default)]
struct DevicesState {
    devices: Vec<MediaDeviceInfo>,
    after_probe: Option<Vec<MediaDeviceInfo>>,
    probes: usize,
    failures: HashMap<TrackKind, DeviceError>,
    display_failure: Option<DeviceError>,
    requests: Vec<TrackConstraints>,
    opened: Vec<LocalTrack>,
    displays: Vec<LocalTrack>,
}

pub struct FakeDevices {
    state: Mutex<DevicesState>,
    stops: Arc<AtomicUsize>,
    paused: watch::Sender<bool>,
}

impl FakeDevices {
    pub fn new(devices: Vec<MediaDeviceInfo>) -> Self {
        Self {
            state: Mutex::new(DevicesState {
                devices,
                ..Default::default()
            }),
            stops: Arc::new(AtomicUsize::new(0)),
            paused: watch::channel(false).0,
        }
    }

    pub fn set_devices(&self, devices: Vec<MediaDeviceInfo>) {
        self.state.lock().devices = devices;
    }

    /// Geräteliste, die nach dem ersten Berechtigungs-Zugriff geliefert wird
    pub fn set_labels_after_probe(&self, devices: Vec<MediaDeviceInfo>) {
        self.state.lock().after_probe = Some(devices);
    }

    pub fn probe_count(&self) -> usize {
        self.state.lock().probes
    }

    pub fn fail_kind(&self, kind: TrackKind, error: DeviceError) {
        self.state.lock().failures.insert(kind, error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.display_failure = None;
    }

    pub fn fail_display(&self, error: DeviceError) {
        self.state.lock().display_failure = Some(error);
    }

    /// Alle erfolgreich geöffneten Geräte-Tracks
    pub fn opened(&self) -> Vec<LocalTrack> {
        self.state.lock().opened.clone()
    }

    pub fn requests(&self) -> Vec<TrackConstraints> {
        self.state.lock().requests.clone()
    }

    pub fn displays(&self) -> Vec<LocalTrack> {
        self.state.lock().displays.clone()
    }

    /// Wie oft eine Quelle freigegeben wurde
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Hält alle folgenden `open` Aufrufe an
    pub fn pause_opens(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_opens(&self) {
        self.paused.send_replace(false);
    }

    async fn gate(&self) {
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;
    }

    fn source(&self) -> Box<dyn TrackSource> {
        Box::new(FakeSource {
            stops: Arc::clone(&self.stops),
        })
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>, DeviceError> {
        Ok(self.state.lock().devices.clone())
    }

    async fn probe_permissions(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.probes += 1;
        if let Some(devices) = state.after_probe.take() {
            state.devices = devices;
        }
        Ok(())
    }

    async fn open(&self, constraints: TrackConstraints) -> Result<LocalTrack, DeviceError> {
        self.state.lock().requests.push(constraints.clone());
        self.gate().await;

        let mut state = self.state.lock();
        if let Some(error) = state.failures.get(&constraints.kind) {
            return Err(error.clone());
        }

        let label = constraints
            .device_id
            .as_deref()
            .and_then(|id| state.devices.iter().find(|d| d.id == id))
            .map(|d| d.label.clone())
            .unwrap_or_else(|| format!("{:?}", constraints.kind));
        let track = LocalTrack::new(
            constraints.kind,
            TrackOrigin::Device,
            label,
            constraints.device_id,
            self.source(),
        );
        state.opened.push(track.clone());
        Ok(track)
    }

    async fn open_display(&self) -> Result<LocalTrack, DeviceError> {
        self.gate().await;

        let mut state = self.state.lock();
        if let Some(error) = &state.display_failure {
            return Err(error.clone());
        }
        let track = LocalTrack::new(TrackKind::Video, TrackOrigin::Screen, "Screen", None, self.source());
        state.displays.push(track.clone());
        Ok(track)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

pub struct FakeSignaling {
    sent: Mutex<Vec<OutboundMessage>>,
    inbound: broadcast::Sender<InboundMessage>,
    fail: AtomicBool,
}

impl FakeSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: broadcast::channel(64).0,
            fail: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn statuses(&self) -> Vec<CallStatus> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::CallResponse { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn call_requests(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::CallRequest { .. }))
            .count()
    }

    /// Reihenfolge aller verschickten Signale
    pub fn signals(&self) -> Vec<(SignalKind, String)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Signal(envelope) => {
                    Some((envelope.kind, envelope.payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn signals_of(&self, kind: SignalKind) -> Vec<String> {
        self.signals()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn inject(&self, message: InboundMessage) {
        let _ = self.inbound.send(message);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddTrack(String),
    ReplaceTrack(SenderId, String),
    RemoveTrack(SenderId),
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind, String),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
pub struct FakePeer {
    ops: Mutex<Vec<PeerOp>>,
    next_sender: AtomicU64,
    fail_replace: AtomicBool,
    closes: AtomicUsize,
    events: Mutex<Option<TransportEvents>>,
}

impl FakePeer {
    pub fn ops(&self) -> Vec<PeerOp> {
        self.ops.lock().clone()
    }

    pub fn fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Simuliert ein Event der Peer Connection
    pub fn emit(&self, event: TransportEvent) {
        let events = self.events.lock().clone();
        if let Some(events) = events {
            events.emit(event);
        }
    }

    fn record(&self, op: PeerOp) {
        self.ops.lock().push(op);
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, TransportError> {
        self.record(PeerOp::AddTrack(track.id().to_string()));
        Ok(SenderId(self.next_sender.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<(), TransportError> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(TransportError::Track("replace refused".to_string()));
        }
        self.record(PeerOp::ReplaceTrack(sender, track.id().to_string()));
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), TransportError> {
        self.record(PeerOp::RemoveTrack(sender));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        self.record(PeerOp::CreateOffer);
        Ok(FAKE_OFFER.to_string())
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.record(PeerOp::CreateAnswer);
        Ok(FAKE_ANSWER.to_string())
    }

    async fn set_remote_description(&self, kind: SdpKind, payload: &str) -> Result<(), TransportError> {
        self.record(PeerOp::SetRemote(kind, payload.to_string()));
        Ok(())
    }

    async fn add_remote_candidate(&self, payload: &str) -> Result<(), TransportError> {
        self.record(PeerOp::AddCandidate(payload.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.record(PeerOp::Close);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail: AtomicBool,
}

impl FakeTransportFactory {
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _config: &CallConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::CreateFailed("no network".to_string()));
        }
        let peer = Arc::new(FakePeer::default());
        *peer.events.lock() = Some(events);
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// PRESENTER
// ============================================================================

#[derive(Default)]
pub struct RecordingPresenter {
    started: AtomicUsize,
    stopped: AtomicUsize,
    surfaced: AtomicUsize,
}

impl RecordingPresenter {
    pub fn rings_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn rings_stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn surfaced(&self) -> usize {
        self.surfaced.load(Ordering::SeqCst)
    }
}

impl CallPresenter for RecordingPresenter {
    fn start_ring(&self, _role: CallRole) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_ring(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }

    fn surface_window(&self) {
        self.surfaced.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// HARNESS
// ============================================================================

/// Ein Orchestrator mit Fakes für alle Collaborators
pub struct Harness {
    pub orchestrator: CallOrchestrator,
    pub signaling: Arc<FakeSignaling>,
    pub devices: Arc<FakeDevices>,
    pub transports: Arc<FakeTransportFactory>,
    pub presenter: Arc<RecordingPresenter>,
}

impl Harness {
    pub fn new(devices: Vec<MediaDeviceInfo>) -> Self {
        let signaling = FakeSignaling::new();
        let devices = Arc::new(FakeDevices::new(devices));
        let transports = Arc::new(FakeTransportFactory::default());
        let presenter = Arc::new(RecordingPresenter::default());

        let orchestrator = CallOrchestrator::new(
            "alice",
            CallConfig::default(),
            Collaborators {
                signaling: signaling.clone(),
                devices: devices.clone(),
                transports: transports.clone(),
                presenter: presenter.clone(),
            },
        );

        Self {
            orchestrator,
            signaling,
            devices,
            transports,
            presenter,
        }
    }

    /// Mikrofon und zwei Kameras
    pub fn with_av() -> Self {
        Self::new(vec![
            device("default", "Built-in Microphone", TrackKind::Audio),
            device("mic-usb", "USB Headset", TrackKind::Audio),
            device("camA", "Front Camera", TrackKind::Video),
            device("camB", "Back Camera", TrackKind::Video),
        ])
    }

    pub fn peer(&self) -> Arc<FakePeer> {
        self.transports.last_peer().expect("no peer connection created")
    }

    pub async fn wait_for_peer(&self) -> Arc<FakePeer> {
        let transports = Arc::clone(&self.transports);
        wait_until(|| transports.last_peer().is_some()).await;
        self.peer()
    }
}
