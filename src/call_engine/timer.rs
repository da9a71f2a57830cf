//! Ring-Timeout und Gesprächsdauer
//!
//! Beide Modi schließen sich aus: das Starten des einen bricht den anderen ab.
//! Gemessen wird mit `tokio::time::Instant` (monoton, unabhängig von der
//! Systemuhr).

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Aktiver Modus des Timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Idle,
    RingTimeout,
    Duration,
}

struct DurationClock {
    started: Instant,
    ticker: JoinHandle<()>,
}

/// Abbrechbarer Timer einer Session
#[derive(Default)]
pub struct CallTimer {
    ring: Option<JoinHandle<()>>,
    clock: Option<DurationClock>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet den Ring-Timeout; `on_expire` läuft genau einmal nach `timeout`
    pub fn start_ring_timeout<F>(&mut self, timeout: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();
        self.ring = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_expire();
        }));
    }

    /// Startet die Gesprächsdauer; `on_tick` bekommt jede Sekunde die verstrichene Zeit
    pub fn start_duration<F>(&mut self, on_tick: F)
    where
        F: Fn(Duration) + Send + 'static,
    {
        self.cancel();
        let started = Instant::now();
        let period = Duration::from_secs(1);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(started + period, period);
            loop {
                let now = interval.tick().await;
                on_tick(now.duration_since(started));
            }
        });
        self.clock = Some(DurationClock { started, ticker });
    }

    /// Beginn der laufenden Gesprächsdauer
    pub fn started_at(&self) -> Option<Instant> {
        self.clock.as_ref().map(|clock| clock.started)
    }

    /// Verstrichene Gesprächsdauer, falls die Uhr läuft
    pub fn elapsed(&self) -> Option<Duration> {
        self.clock.as_ref().map(|clock| clock.started.elapsed())
    }

    pub fn mode(&self) -> TimerMode {
        if self.clock.is_some() {
            TimerMode::Duration
        } else if self.ring.as_ref().is_some_and(|h| !h.is_finished()) {
            TimerMode::RingTimeout
        } else {
            TimerMode::Idle
        }
    }

    /// Bricht beide Modi ab (mehrfach aufrufbar)
    pub fn cancel(&mut self) {
        if let Some(handle) = self.ring.take() {
            handle.abort();
        }
        if let Some(clock) = self.clock.take() {
            clock.ticker.abort();
        }
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for CallTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTimer")
            .field("mode", &self.mode())
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
