//! Darstellung außerhalb der Engine (Klingelton, Anruf-Fenster)
//!
//! Die App implementiert `CallPresenter`; die Engine ruft ihn nur an den
//! passenden Stellen im Ablauf auf.

use super::state::CallRole;
use std::sync::Arc;

/// Hooks für Klingelton und Fenster
pub trait CallPresenter: Send + Sync {
    /// Klingelton starten (ausgehend: Freizeichen, eingehend: Klingeln)
    fn start_ring(&self, _role: CallRole) {}

    fn stop_ring(&self) {}

    /// Anruf-Fenster in den Vordergrund holen
    fn surface_window(&self) {}
}

/// Presenter ohne Wirkung
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPresenter;

impl CallPresenter for NoopPresenter {}

/// Klingelton einer Engine-Instanz; Start und Stop sind idempotent
pub struct RingTone {
    presenter: Arc<dyn CallPresenter>,
    playing: bool,
}

impl RingTone {
    pub fn new(presenter: Arc<dyn CallPresenter>) -> Self {
        Self {
            presenter,
            playing: false,
        }
    }

    pub fn start(&mut self, role: CallRole) {
        if self.playing {
            return;
        }
        self.playing = true;
        self.presenter.start_ring(role);
    }

    pub fn stop(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        self.presenter.stop_ring();
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn surface_window(&self) {
        self.presenter.surface_window();
    }
}

impl std::fmt::Debug for RingTone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingTone").field("playing", &self.playing).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::testing::RecordingPresenter;

    #[test]
    fn test_ring_tone_start_stop_once() {
        let presenter = Arc::new(RecordingPresenter::default());
        let mut ring = RingTone::new(presenter.clone());

        ring.start(CallRole::Receiver);
        ring.start(CallRole::Receiver);
        ring.stop();
        ring.stop();

        assert_eq!(presenter.rings_started(), 1);
        assert_eq!(presenter.rings_stopped(), 1);
        assert!(!ring.is_playing());
    }
}
