//! Offer/Answer-Ablauf einer Session
//!
//! `NegotiationMachine` hält den Status einer Session und entscheidet, wann
//! Offer und Candidates verschickt werden dürfen. Sie führt selbst keine
//! IO aus; `SignalOutbox` verschickt die Nachrichten über das Signaling.

use super::candidates::CandidateBuffer;
use super::state::{CallRole, CallSession, CallState};
use crate::signaling::{
    CallStatus, OutboundMessage, SignalEnvelope, SignalKind, SignalingChannel,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

// ============================================================================
// NEGOTIATION MACHINE
// ============================================================================

#[derive(Debug)]
pub struct NegotiationMachine {
    session: CallSession,
    candidates: CandidateBuffer,
    local_offer: Option<String>,
    offer_sent: bool,
    peer_accepted: bool,
    held_offer: Option<String>,
}

impl NegotiationMachine {
    pub fn new(session: CallSession) -> Self {
        Self {
            session,
            candidates: CandidateBuffer::new(),
            local_offer: None,
            offer_sent: false,
            peer_accepted: false,
            held_offer: None,
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn state(&self) -> CallState {
        self.session.state
    }

    pub fn role(&self) -> CallRole {
        self.session.role
    }

    /// Prüft ob eine Nachricht zu dieser Session gehört
    pub fn is_session(&self, room_id: &str) -> bool {
        self.session.room_id == room_id
    }

    /// Wechselt den Status entlang der erlaubten Kanten
    pub fn transition(&mut self, next: CallState) -> Result<CallState, InvalidTransition> {
        let from = self.session.state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.session.state = next;
        tracing::info!("Call {} state: {:?} -> {:?}", self.session.room_id, from, next);
        Ok(from)
    }

    /// Ob ein eingehendes Signal in dieser Rolle erwartet wird
    ///
    /// Offers gehen nur an den Angerufenen, Answers nur an den Anrufer.
    pub fn expects(&self, kind: SignalKind) -> bool {
        match kind {
            SignalKind::Offer => self.session.role == CallRole::Receiver,
            SignalKind::Answer => self.session.role == CallRole::Initiator,
            SignalKind::Candidate | SignalKind::Leave => true,
        }
    }

    // ========================================================================
    // OFFER GATE
    // ========================================================================

    /// Merkt sich das fertige Offer
    ///
    /// Gibt es zurück, wenn die Gegenseite bereits angenommen hat und es
    /// jetzt verschickt werden muss.
    pub fn offer_built(&mut self, offer: String) -> Option<String> {
        self.local_offer = Some(offer);
        self.release_offer()
    }

    /// Die Gegenseite hat angenommen
    ///
    /// Gibt das Offer zurück, falls es schon gebaut und noch nicht
    /// verschickt wurde.
    pub fn peer_accepted(&mut self) -> Option<String> {
        self.peer_accepted = true;
        self.release_offer()
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    fn release_offer(&mut self) -> Option<String> {
        if !self.peer_accepted || self.offer_sent {
            return None;
        }
        let offer = self.local_offer.clone()?;
        self.offer_sent = true;
        Some(offer)
    }

    /// Hält ein Offer fest, das vor den eigenen Tracks eintrifft
    pub fn hold_offer(&mut self, payload: String) {
        if self.held_offer.replace(payload).is_some() {
            tracing::debug!("Replacing previously held offer");
        }
    }

    pub fn take_held_offer(&mut self) -> Option<String> {
        self.held_offer.take()
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    /// Neuer lokaler Candidate; gibt ihn zurück, wenn er sofort raus darf
    pub fn local_candidate(&mut self, candidate: String) -> Option<String> {
        self.candidates.push(candidate)
    }

    /// Einmaliges Leeren des Candidate-Puffers
    pub fn flush_candidates(&mut self) -> Vec<String> {
        self.candidates.flush()
    }

    pub fn discard_candidates(&mut self) {
        self.candidates.discard();
        self.held_offer = None;
    }

    /// Status, den ein lokales Auflegen im aktuellen Zustand meldet
    pub fn hang_up_status(&self) -> Option<CallStatus> {
        match self.session.state {
            CallState::RingingOut => Some(CallStatus::Cancelled),
            CallState::RingingIn => Some(CallStatus::Rejected),
            CallState::Negotiating | CallState::Connected => Some(CallStatus::Dropped),
            CallState::Idle | CallState::Ended | CallState::Error => None,
        }
    }
}

// ============================================================================
// SIGNAL OUTBOX
// ============================================================================

/// Verschickt Nachrichten einer Session, Fehler werden nur geloggt
#[derive(Clone)]
pub struct SignalOutbox {
    channel: Arc<dyn SignalingChannel>,
}

impl SignalOutbox {
    pub fn new(channel: Arc<dyn SignalingChannel>) -> Self {
        Self { channel }
    }

    pub async fn call_request(&self, session: &CallSession) -> bool {
        self.send(OutboundMessage::CallRequest {
            room_id: session.room_id.clone(),
            target_id: session.remote_id.clone(),
            is_video: session.media_kind.is_video(),
        })
        .await
    }

    pub async fn status(&self, session: &CallSession, status: CallStatus) -> bool {
        tracing::info!("Sending call status {:?} for {}", status, session.room_id);
        self.send(OutboundMessage::CallResponse {
            room_id: session.room_id.clone(),
            remote_id: session.remote_id.clone(),
            status,
        })
        .await
    }

    pub async fn signal(&self, session: &CallSession, kind: SignalKind, payload: String) -> bool {
        self.send(OutboundMessage::Signal(SignalEnvelope {
            session_id: session.room_id.clone(),
            sender_id: session.local_id.clone(),
            target_id: session.remote_id.clone(),
            kind,
            payload,
            is_video: session.media_kind.is_video(),
        }))
        .await
    }

    async fn send(&self, message: OutboundMessage) -> bool {
        match self.channel.send(message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Signaling send failed: {}", e);
                false
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::state::MediaKind;

    fn machine(role: CallRole) -> NegotiationMachine {
        NegotiationMachine::new(CallSession::new(
            "room-1".to_string(),
            "alice".to_string(),
            "bob".to_string(),
            MediaKind::Audio,
            role,
        ))
    }

    #[test]
    fn test_offer_waits_for_acceptance() {
        let mut machine = machine(CallRole::Initiator);
        assert_eq!(machine.offer_built("offer".to_string()), None);
        assert!(!machine.offer_sent());

        assert_eq!(machine.peer_accepted(), Some("offer".to_string()));
        assert!(machine.offer_sent());
        assert_eq!(machine.peer_accepted(), None);
    }

    #[test]
    fn test_offer_sent_when_built_after_acceptance() {
        let mut machine = machine(CallRole::Initiator);
        assert_eq!(machine.peer_accepted(), None);
        assert_eq!(machine.offer_built("offer".to_string()), Some("offer".to_string()));
    }

    #[test]
    fn test_transition_rejects_skipped_states() {
        let mut machine = machine(CallRole::Initiator);
        assert!(machine.transition(CallState::Connected).is_err());
        assert_eq!(machine.transition(CallState::RingingOut), Ok(CallState::Idle));
        assert_eq!(machine.state(), CallState::RingingOut);
    }

    #[test]
    fn test_hang_up_status_per_state() {
        let mut out = machine(CallRole::Initiator);
        out.transition(CallState::RingingOut).unwrap();
        assert_eq!(out.hang_up_status(), Some(CallStatus::Cancelled));

        let mut incoming = machine(CallRole::Receiver);
        incoming.transition(CallState::RingingIn).unwrap();
        assert_eq!(incoming.hang_up_status(), Some(CallStatus::Rejected));
        incoming.transition(CallState::Negotiating).unwrap();
        assert_eq!(incoming.hang_up_status(), Some(CallStatus::Dropped));
        incoming.transition(CallState::Ended).unwrap();
        assert_eq!(incoming.hang_up_status(), None);
    }

    #[test]
    fn test_role_filters_descriptions() {
        let initiator = machine(CallRole::Initiator);
        assert!(!initiator.expects(SignalKind::Offer));
        assert!(initiator.expects(SignalKind::Answer));

        let receiver = machine(CallRole::Receiver);
        assert!(receiver.expects(SignalKind::Offer));
        assert!(!receiver.expects(SignalKind::Answer));
        assert!(receiver.expects(SignalKind::Candidate));
    }

    #[test]
    fn test_discard_drops_held_offer() {
        let mut machine = machine(CallRole::Receiver);
        machine.hold_offer("offer".to_string());
        machine.local_candidate("c1".to_string());
        machine.discard_candidates();

        assert_eq!(machine.take_held_offer(), None);
        assert!(machine.flush_candidates().is_empty());
    }
}
