//! Call-Status und Session-Daten
//!
//! Die erlaubten Übergänge sind hier zentral definiert, damit die
//! NegotiationMachine keinen Zustand überspringen kann.

use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf klingelt bei der Gegenseite
    RingingOut,
    /// Eingehender Anruf wartet auf Antwort
    RingingIn,
    /// Offer/Answer-Austausch läuft
    Negotiating,
    /// Anruf aktiv
    Connected,
    /// Anruf beendet
    Ended,
    /// Anruf wegen Geräte- oder Transportfehler abgebrochen
    Error,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Error)
    }

    pub fn is_ringing(self) -> bool {
        matches!(self, CallState::RingingOut | CallState::RingingIn)
    }

    /// Medien-Steuerung (Mute, Gerätewechsel, Screen-Share) ist erst ab hier erlaubt
    pub fn has_media(self) -> bool {
        matches!(self, CallState::Negotiating | CallState::Connected)
    }

    /// Prüft ob der Übergang `self → next` erlaubt ist
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;

        match (self, next) {
            (Idle, RingingOut) | (Idle, RingingIn) => true,
            (RingingOut, Negotiating) | (RingingIn, Negotiating) => true,
            (Negotiating, Connected) => true,
            (RingingOut | RingingIn | Negotiating | Connected, Ended) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Audio- oder Videoanruf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_video_flag(is_video: bool) -> Self {
        if is_video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    pub fn is_video(self) -> bool {
        self == MediaKind::Video
    }
}

/// Wer den Anruf gestartet hat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Receiver,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Eine Anruf-Session zwischen genau zwei Teilnehmern
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    pub room_id: String,
    pub local_id: String,
    pub remote_id: String,
    pub media_kind: MediaKind,
    pub role: CallRole,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(
        room_id: String,
        local_id: String,
        remote_id: String,
        media_kind: MediaKind,
        role: CallRole,
    ) -> Self {
        Self {
            room_id,
            local_id,
            remote_id,
            media_kind,
            role,
            state: CallState::Idle,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
