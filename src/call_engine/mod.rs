//! Call Engine Module - Anrufablauf zwischen zwei Peers
//!
//! Dieses Modul verwaltet:
//! - Zustandsautomat und Offer/Answer-Ablauf einer Session
//! - Geräte (Mikrofon, Kamera, Bildschirm) und lokale Tracks
//! - WebRTC Peer Connections
//! - Ring-Timeout und Gesprächsdauer

mod candidates;
#[cfg(feature = "audio-capture")]
mod capture;
mod devices;
mod engine;
mod negotiation;
mod orchestrator;
mod presenter;
mod rtc;
mod state;
mod timer;
mod track;
mod transport;

#[cfg(test)]
mod testing;

pub use candidates::CandidateBuffer;
#[cfg(feature = "audio-capture")]
pub use capture::{CpalDevices, SAMPLE_RATE};
pub use devices::{
    Acquisition, DeviceError, DeviceList, DeviceManager, DeviceSelection, FacingMode,
    FacingSwitch, MediaDeviceInfo, MediaDevices, TrackConstraints, DEFAULT_DEVICE_ID,
};
pub use negotiation::{InvalidTransition, NegotiationMachine, SignalOutbox};
pub use orchestrator::{CallError, CallEvent, CallOrchestrator, Collaborators};
pub use presenter::{CallPresenter, NoopPresenter, RingTone};
pub use rtc::{RtcPeerTransport, RtcTransportFactory};
pub use state::{CallRole, CallSession, CallState, MediaKind};
pub use timer::{CallTimer, TimerMode};
pub use track::{LocalTrack, RemoteTrackInfo, TrackEndSignal, TrackKind, TrackOrigin, TrackSource};
pub use transport::{
    PeerTransport, SdpKind, SenderId, TransportError, TransportEvent, TransportEvents,
    TransportFactory, TransportSession, TransportState,
};
