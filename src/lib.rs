//! Pulse Call - Anruf-Engine für serverlose P2P Audio/Video-Calls
//!
//! Enthält:
//! - Signaling über einen WebSocket-Relay
//! - Zustandsautomat für ausgehende und eingehende Anrufe
//! - WebRTC für die Medienverbindung
//! - Mikrofon-Capture über cpal (Feature `audio-capture`)

pub mod call_engine;
pub mod config;
pub mod signaling;

pub use call_engine::{
    CallError, CallEvent, CallOrchestrator, CallPresenter, CallState, Collaborators, MediaKind,
    TrackKind,
};
pub use config::CallConfig;

use tracing_subscriber::EnvFilter;

/// Standard-Filter, falls `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "pulse_call=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Kann mehrfach aufgerufen werden; nur der erste Aufruf installiert den
/// Subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Pulse call engine logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }
}
