//! Engine-Task
//!
//! Besitzt die aktuelle Session und verarbeitet Befehle, Signaling-
//! Nachrichten, Transport-Events und Timer nacheinander. Geräte werden auf
//! eigenen Tasks geöffnet und kommen als `Internal` Event zurück; jedes
//! Event trägt die Generation seiner Session, damit Events einer bereits
//! beendeten Session ins Leere laufen.

use super::devices::{Acquisition, DeviceError, DeviceList, DeviceManager, FacingSwitch, TrackConstraints};
use super::negotiation::{NegotiationMachine, SignalOutbox};
use super::orchestrator::{CallError, CallEvent, Collaborators, Command, Reply, Snapshot};
use super::presenter::RingTone;
use super::state::{CallRole, CallSession, CallState, MediaKind};
use super::timer::CallTimer;
use super::track::{LocalTrack, TrackKind, TrackOrigin};
use super::transport::{
    SdpKind, TransportError, TransportEvent, TransportEvents, TransportFactory, TransportSession,
    TransportState,
};
use crate::config::CallConfig;
use crate::signaling::{
    CallStatus, InboundMessage, RelayNotification, RelayNotificationKind, SignalEnvelope,
    SignalKind,
};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

// ============================================================================
// INTERNAL EVENTS
// ============================================================================

pub(crate) enum Internal {
    MediaReady {
        generation: u64,
        result: Result<Vec<LocalTrack>, DeviceError>,
    },
    TrackReady {
        generation: u64,
        purpose: TrackPurpose,
        result: Result<LocalTrack, DeviceError>,
        reply: Option<TrackReply>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    RingTimeout {
        generation: u64,
    },
    DurationTick {
        generation: u64,
        elapsed: Duration,
    },
    ScreenShareEnded {
        generation: u64,
        track_id: String,
    },
}

impl Internal {
    fn generation(&self) -> u64 {
        match self {
            Internal::MediaReady { generation, .. }
            | Internal::TrackReady { generation, .. }
            | Internal::Transport { generation, .. }
            | Internal::RingTimeout { generation }
            | Internal::DurationTick { generation, .. }
            | Internal::ScreenShareEnded { generation, .. } => *generation,
        }
    }

    /// Gibt Tracks frei, die keine Session mehr abholt
    fn release(self, state: CallState) {
        match self {
            Internal::MediaReady {
                result: Ok(tracks), ..
            } => tracks.iter().for_each(LocalTrack::stop),
            Internal::TrackReady { result, reply, .. } => {
                if let Ok(track) = result {
                    track.stop();
                }
                reply_to(reply, Err(CallError::InvalidState(state)));
            }
            _ => {}
        }
    }
}

/// Wofür ein einzeln geöffneter Track gedacht ist
pub(crate) enum TrackPurpose {
    Switch { kind: TrackKind, device_id: String },
    Facing(FacingSwitch),
    ScreenShare,
    ScreenShareRevert,
    /// Kamera fehlt beim Einschalten des Videos
    Camera { device_id: Option<String> },
}

/// Antwortkanal eines einzeln geöffneten Tracks
pub(crate) enum TrackReply {
    Done(Reply<()>),
    Enabled(Reply<bool>),
}

impl TrackReply {
    fn send(self, result: Result<(), CallError>) {
        match self {
            TrackReply::Done(reply) => {
                let _ = reply.send(result);
            }
            TrackReply::Enabled(reply) => {
                let _ = reply.send(result.map(|()| true));
            }
        }
    }
}

fn reply_to(reply: Option<TrackReply>, result: Result<(), CallError>) {
    if let Some(reply) = reply {
        reply.send(result);
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

struct ActiveCall {
    generation: u64,
    machine: NegotiationMachine,
    transport: Option<TransportSession>,
    call_request_sent: bool,
    torn_down: bool,
}

impl ActiveCall {
    fn is_live(&self) -> bool {
        !self.torn_down && !self.machine.state().is_terminal()
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

pub(crate) struct CallEngine {
    local_id: String,
    config: CallConfig,
    outbox: SignalOutbox,
    transports: Arc<dyn TransportFactory>,
    devices: DeviceManager,
    ring: RingTone,
    timer: CallTimer,
    call: Option<ActiveCall>,
    generation: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<CallEvent>,
    shared: Arc<RwLock<Snapshot>>,
}

impl CallEngine {
    pub(crate) fn new(
        local_id: String,
        config: CallConfig,
        collaborators: Collaborators,
        internal_tx: mpsc::UnboundedSender<Internal>,
        events: broadcast::Sender<CallEvent>,
        shared: Arc<RwLock<Snapshot>>,
    ) -> Self {
        Self {
            local_id,
            config,
            outbox: SignalOutbox::new(collaborators.signaling),
            transports: collaborators.transports,
            devices: DeviceManager::new(collaborators.devices),
            ring: RingTone::new(collaborators.presenter),
            timer: CallTimer::new(),
            call: None,
            generation: 0,
            internal_tx,
            events,
            shared,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: broadcast::Receiver<InboundMessage>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        tracing::info!("Call engine started for {}", self.local_id);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;

                Some(event) = internal.recv() => self.handle_internal(event).await,

                message = inbound.recv(), if inbound_open => match message {
                    Ok(message) => self.handle_inbound(message).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signaling receiver lagged, {} messages dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Signaling channel closed");
                        inbound_open = false;
                    }
                },

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        let _ = self.hang_up().await;
        tracing::info!("Call engine stopped");
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                room_id,
                remote_id,
                media_kind,
                reply,
            } => {
                let result = self.start(room_id, remote_id, media_kind).await;
                let _ = reply.send(result);
            }
            Command::Incoming {
                room_id,
                remote_id,
                media_kind,
                reply,
            } => {
                self.incoming(room_id, remote_id, media_kind).await;
                let _ = reply.send(Ok(()));
            }
            Command::Accept { reply } => {
                let result = self.accept().await;
                let _ = reply.send(result);
            }
            Command::Reject { reason, reply } => {
                let result = self.reject(&reason).await;
                let _ = reply.send(result);
            }
            Command::HangUp { reply } => {
                let result = self.hang_up().await;
                let _ = reply.send(result);
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle(TrackKind::Audio).map(|enabled| !enabled));
            }
            Command::ToggleVideo { reply } => self.toggle_video(reply).await,
            Command::SwitchDevice {
                kind,
                device_id,
                reply,
            } => self.switch_device(kind, device_id, reply),
            Command::SwitchFacing { reply } => self.switch_facing(reply),
            Command::StartScreenShare { reply } => self.start_screen_share(reply),
            Command::StopScreenShare { reply } => {
                self.stop_screen_share(Some(TrackReply::Done(reply))).await
            }
            Command::RefreshDevices { reply } => {
                let result = self.refresh_devices().await.map_err(CallError::from);
                let _ = reply.send(result);
            }
        }
    }

    async fn start(
        &mut self,
        room_id: String,
        remote_id: String,
        media_kind: MediaKind,
    ) -> Result<String, CallError> {
        self.end_live_call().await;

        tracing::info!("Starting {:?} call to {} in room {}", media_kind, remote_id, room_id);
        let session = CallSession::new(
            room_id.clone(),
            self.local_id.clone(),
            remote_id,
            media_kind,
            CallRole::Initiator,
        );
        let generation = self.begin(session);
        self.transition(CallState::RingingOut);

        let acquisition = match self.plan_acquisition(media_kind).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                tracing::warn!("Cannot start call: {}", e);
                self.emit(CallEvent::Error(e.to_string()));
                self.finish(CallState::Ended, Some(CallStatus::Rejected)).await;
                return Err(e.into());
            }
        };

        self.arm_ring_timeout(generation);
        self.ring.start(CallRole::Initiator);
        self.spawn_media(generation, acquisition);
        Ok(room_id)
    }

    async fn incoming(&mut self, room_id: String, remote_id: String, media_kind: MediaKind) {
        if self.live_call().is_some_and(|c| c.machine.is_session(&room_id)) {
            tracing::debug!("Duplicate call request for {} ignored", room_id);
            return;
        }
        self.end_live_call().await;

        tracing::info!("Incoming {:?} call from {} in room {}", media_kind, remote_id, room_id);
        let session = CallSession::new(
            room_id,
            self.local_id.clone(),
            remote_id,
            media_kind,
            CallRole::Receiver,
        );
        let generation = self.begin(session);
        self.transition(CallState::RingingIn);
        self.arm_ring_timeout(generation);
        self.ring.start(CallRole::Receiver);
    }

    async fn accept(&mut self) -> Result<(), CallError> {
        let state = self.current_state();
        if state != CallState::RingingIn {
            return Err(CallError::InvalidState(state));
        }
        let (generation, media_kind) = self
            .live_call()
            .map(|c| (c.generation, c.machine.session().media_kind))
            .ok_or(CallError::InvalidState(state))?;

        let acquisition = match self.plan_acquisition(media_kind).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                tracing::warn!("Cannot accept call: {}", e);
                self.emit(CallEvent::Error(e.to_string()));
                self.finish(CallState::Ended, Some(CallStatus::Rejected)).await;
                return Err(e.into());
            }
        };

        self.timer.cancel();
        self.ring.stop();
        self.transition(CallState::Negotiating);
        self.ring.surface_window();
        self.spawn_media(generation, acquisition);
        Ok(())
    }

    async fn reject(&mut self, reason: &str) -> Result<(), CallError> {
        let state = self.current_state();
        if state != CallState::RingingIn {
            return Err(CallError::InvalidState(state));
        }
        tracing::info!("Rejecting incoming call: {}", reason);
        self.finish(CallState::Ended, Some(CallStatus::Rejected)).await;
        Ok(())
    }

    async fn hang_up(&mut self) -> Result<(), CallError> {
        let Some(status) = self.live_call().and_then(|c| c.machine.hang_up_status()) else {
            tracing::debug!("Hang up without live call ignored");
            return Ok(());
        };
        tracing::info!("Hanging up ({:?})", status);
        self.finish(CallState::Ended, Some(status)).await;
        Ok(())
    }

    async fn end_live_call(&mut self) {
        if self.live_call().is_some() {
            tracing::info!("Replacing active call");
            let _ = self.hang_up().await;
        }
    }

    // ========================================================================
    // MEDIA COMMANDS
    // ========================================================================

    fn media_transport(&self) -> Result<&TransportSession, CallError> {
        let state = self.current_state();
        if !state.has_media() {
            return Err(CallError::InvalidState(state));
        }
        self.live_call()
            .and_then(|c| c.transport.as_ref())
            .ok_or(CallError::InvalidState(state))
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let enabled = self
            .media_transport()?
            .toggle_enabled(kind)
            .ok_or(CallError::Device(DeviceError::NoDevice))?;
        self.emit(CallEvent::TrackEnabledChanged { kind, enabled });
        Ok(enabled)
    }

    /// Schaltet das Video um
    ///
    /// Fehlt bei einem Videoanruf der Kamera-Track (Anruf ohne Kamera
    /// begonnen), wird die gewählte Kamera neu geöffnet und eingeschaltet.
    async fn toggle_video(&mut self, reply: Reply<bool>) {
        let has_camera = match self.media_transport() {
            Ok(transport) => transport.local_track(TrackKind::Video).is_some(),
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let is_video = self
            .live_call()
            .is_some_and(|c| c.machine.session().media_kind.is_video());
        if has_camera || !is_video {
            let _ = reply.send(self.toggle(TrackKind::Video));
            return;
        }

        if let Err(e) = self.refresh_devices().await {
            tracing::warn!("Device refresh before reopening camera failed: {}", e);
        }
        let device_id = self.devices.list().selection.video_device_id.clone();
        tracing::info!("No camera track, reopening camera {:?}", device_id);
        let devices = self.devices.platform();
        let constraints = TrackConstraints::device(TrackKind::Video, device_id.clone());
        self.spawn_track(
            TrackPurpose::Camera { device_id },
            async move { devices.open(constraints).await },
            Some(TrackReply::Enabled(reply)),
        );
    }

    fn switch_device(&mut self, kind: TrackKind, device_id: String, reply: Reply<()>) {
        let acquisition = match self
            .media_transport()
            .and_then(|_| self.devices.switch_to(kind, &device_id).map_err(CallError::from))
        {
            Ok(acquisition) => acquisition,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        tracing::info!("Switching {:?} device to {}", kind, device_id);
        let open = async move {
            acquisition
                .run()
                .await
                .and_then(|mut tracks| tracks.pop().ok_or(DeviceError::NoDevice))
        };
        self.spawn_track(
            TrackPurpose::Switch { kind, device_id },
            open,
            Some(TrackReply::Done(reply)),
        );
    }

    fn switch_facing(&mut self, reply: Reply<()>) {
        let has_camera = match self.media_transport() {
            Ok(transport) => transport.local_track(TrackKind::Video).is_some(),
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if !has_camera {
            let _ = reply.send(Err(DeviceError::NoDevice.into()));
            return;
        }

        let switch = self.devices.facing_switch();
        tracing::info!("Switching camera facing to {:?}", switch.facing);
        let devices = self.devices.platform();
        let constraints = switch.constraints.clone();
        self.spawn_track(
            TrackPurpose::Facing(switch),
            async move { devices.open(constraints).await },
            Some(TrackReply::Done(reply)),
        );
    }

    fn start_screen_share(&mut self, reply: Reply<()>) {
        match self.media_transport() {
            Ok(transport) if transport.is_screen_sharing() => {
                let _ = reply.send(Ok(()));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        }

        tracing::info!("Starting screen share");
        let devices = self.devices.platform();
        self.spawn_track(
            TrackPurpose::ScreenShare,
            async move { devices.open_display().await },
            Some(TrackReply::Done(reply)),
        );
    }

    /// Beendet die Bildschirmfreigabe
    ///
    /// Bei Videoanrufen wird die gewählte Kamera wieder geöffnet, bei
    /// Audioanrufen der Bildschirm-Sender entfernt.
    async fn stop_screen_share(&mut self, reply: Option<TrackReply>) {
        match self.media_transport() {
            Ok(transport) if !transport.is_screen_sharing() => {
                reply_to(reply, Ok(()));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                reply_to(reply, Err(e));
                return;
            }
        }

        let is_video = self
            .live_call()
            .is_some_and(|c| c.machine.session().media_kind.is_video());
        let camera = self.devices.list().selection.video_device_id.clone();

        match camera.filter(|_| is_video) {
            Some(device_id) => {
                tracing::info!("Stopping screen share, reverting to camera {}", device_id);
                let devices = self.devices.platform();
                let constraints = TrackConstraints::device(TrackKind::Video, Some(device_id));
                self.spawn_track(
                    TrackPurpose::ScreenShareRevert,
                    async move { devices.open(constraints).await },
                    reply,
                );
            }
            None => {
                tracing::info!("Stopping screen share");
                let result = self.drop_screen_track().await;
                reply_to(reply, result);
            }
        }
    }

    async fn drop_screen_track(&mut self) -> Result<(), CallError> {
        let result = match self.call.as_mut().and_then(|c| c.transport.as_mut()) {
            Some(transport) => transport.remove_track(TrackKind::Video).await,
            None => Ok(()),
        };
        self.set_screen_sharing(false);
        result.map_err(CallError::from)
    }

    async fn refresh_devices(&mut self) -> Result<DeviceList, DeviceError> {
        let list = self.devices.refresh().await?.clone();
        self.publish_devices();
        Ok(list)
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn handle_inbound(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Signal(envelope) => self.handle_signal(envelope).await,
            InboundMessage::Notification(notification) => {
                self.handle_notification(notification).await
            }
        }
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let Some(call) = self.live_call() else {
            tracing::debug!("Dropping {} signal, no live call", envelope.kind.as_str());
            return;
        };
        if !call.machine.is_session(&envelope.session_id) {
            tracing::debug!(
                "Dropping {} signal for foreign session {}",
                envelope.kind.as_str(),
                envelope.session_id
            );
            return;
        }
        if !call.machine.expects(envelope.kind) {
            tracing::debug!(
                "Dropping unexpected {} signal as {:?}",
                envelope.kind.as_str(),
                call.machine.role()
            );
            return;
        }

        match envelope.kind {
            SignalKind::Offer => self.answer_offer(envelope.payload).await,
            SignalKind::Answer => self.apply_answer(envelope.payload).await,
            SignalKind::Candidate => self.remote_candidate(&envelope.payload).await,
            SignalKind::Leave => {
                tracing::info!("Remote participant left");
                self.finish(CallState::Ended, None).await;
            }
        }
    }

    async fn handle_notification(&mut self, notification: RelayNotification) {
        if notification.kind == RelayNotificationKind::CallRequested {
            match (notification.room_id, notification.from_id) {
                (Some(room_id), Some(from_id)) => {
                    let media_kind = MediaKind::from_video_flag(notification.is_video);
                    self.incoming(room_id, from_id, media_kind).await;
                }
                _ => tracing::warn!("Call request without room or caller ignored"),
            }
            return;
        }

        let Some(call) = self.live_call() else {
            tracing::debug!("Dropping {:?} notification, no live call", notification.kind);
            return;
        };
        if let Some(room_id) = &notification.room_id {
            if !call.machine.is_session(room_id) {
                tracing::debug!("Dropping {:?} for foreign room {}", notification.kind, room_id);
                return;
            }
        }

        match notification.kind {
            RelayNotificationKind::CallAccepted => self.peer_accepted().await,
            RelayNotificationKind::CallRejected
            | RelayNotificationKind::Cancelled
            | RelayNotificationKind::Timeout
            | RelayNotificationKind::Dropped
            | RelayNotificationKind::RoomClosed => {
                tracing::info!("Call ended by relay: {:?}", notification.kind);
                self.finish(CallState::Ended, None).await;
            }
            RelayNotificationKind::CallRequested => {}
        }
    }

    /// Gegenseite hat angenommen: erst jetzt darf das Offer raus
    async fn peer_accepted(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.machine.role() != CallRole::Initiator || call.machine.state() != CallState::RingingOut {
            tracing::debug!("Ignoring call accepted in {:?}", call.machine.state());
            return;
        }
        let offer = call.machine.peer_accepted();

        self.timer.cancel();
        self.ring.stop();
        self.transition(CallState::Negotiating);
        self.ring.surface_window();

        if let Some(offer) = offer {
            self.send_signal(SignalKind::Offer, offer).await;
        }
    }

    async fn answer_offer(&mut self, payload: String) {
        if let Err(e) = self.try_answer_offer(payload).await {
            self.fail(format!("Failed to answer offer: {}", e)).await;
        }
    }

    async fn try_answer_offer(&mut self, payload: String) -> Result<(), TransportError> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };
        let Some(transport) = call.transport.as_mut() else {
            tracing::debug!("Holding offer until local media is ready");
            call.machine.hold_offer(payload);
            return Ok(());
        };
        if transport.has_remote_description() {
            tracing::debug!("Dropping repeated offer, already answered");
            return Ok(());
        }

        transport.set_remote_description(SdpKind::Offer, &payload).await?;
        let answer = transport.create_answer().await?;
        self.outbox
            .signal(call.machine.session(), SignalKind::Answer, answer)
            .await;

        for candidate in call.machine.flush_candidates() {
            self.outbox
                .signal(call.machine.session(), SignalKind::Candidate, candidate)
                .await;
        }
        Ok(())
    }

    async fn apply_answer(&mut self, payload: String) {
        if let Err(e) = self.try_apply_answer(payload).await {
            self.fail(format!("Failed to apply answer: {}", e)).await;
        }
    }

    async fn try_apply_answer(&mut self, payload: String) -> Result<(), TransportError> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };
        let offer_sent = call.machine.offer_sent();
        let Some(transport) = call.transport.as_mut().filter(|_| offer_sent) else {
            tracing::debug!("Dropping answer, no offer sent");
            return Ok(());
        };
        if transport.has_remote_description() {
            tracing::debug!("Dropping duplicate answer");
            return Ok(());
        }

        transport.set_remote_description(SdpKind::Answer, &payload).await?;
        for candidate in call.machine.flush_candidates() {
            self.outbox
                .signal(call.machine.session(), SignalKind::Candidate, candidate)
                .await;
        }
        Ok(())
    }

    async fn remote_candidate(&mut self, payload: &str) {
        let Some(transport) = self.live_call().and_then(|c| c.transport.as_ref()) else {
            tracing::debug!("Dropping remote candidate, no transport yet");
            return;
        };
        match transport.add_remote_candidate(payload).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Dropping remote candidate before remote description"),
            Err(e) => tracing::warn!("Failed to apply remote candidate: {}", e),
        }
    }

    // ========================================================================
    // INTERNAL EVENTS
    // ========================================================================

    async fn handle_internal(&mut self, event: Internal) {
        let generation = event.generation();
        if !self.live_call().is_some_and(|c| c.generation == generation) {
            tracing::debug!("Dropping stale event of call generation {}", generation);
            event.release(self.current_state());
            return;
        }

        match event {
            Internal::MediaReady { result, .. } => self.media_ready(result).await,
            Internal::TrackReady {
                purpose,
                result,
                reply,
                ..
            } => self.track_ready(purpose, result, reply).await,
            Internal::Transport { event, .. } => self.transport_event(event).await,
            Internal::RingTimeout { .. } => self.ring_timeout().await,
            Internal::DurationTick { elapsed, .. } => {
                if self.current_state() == CallState::Connected {
                    self.emit(CallEvent::DurationTick(elapsed));
                }
            }
            Internal::ScreenShareEnded { track_id, .. } => self.screen_share_ended(&track_id).await,
        }
    }

    async fn media_ready(&mut self, result: Result<Vec<LocalTrack>, DeviceError>) {
        let role = self.role();
        let tracks = match result {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::error!("Media acquisition failed: {}", e);
                self.emit(CallEvent::Error(e.to_string()));
                match role {
                    CallRole::Receiver => {
                        self.finish(CallState::Ended, Some(CallStatus::Rejected)).await
                    }
                    CallRole::Initiator => {
                        self.finish(CallState::Error, Some(CallStatus::Dropped)).await
                    }
                }
                return;
            }
        };

        if role == CallRole::Receiver {
            self.send_status(CallStatus::Accepted).await;
        }
        if let Err(e) = self.open_transport(tracks).await {
            self.fail(format!("Failed to set up transport: {}", e)).await;
            return;
        }

        match role {
            CallRole::Initiator => {
                if let Err(e) = self.prepare_offer().await {
                    self.fail(format!("Failed to create offer: {}", e)).await;
                }
            }
            CallRole::Receiver => {
                let held = self.call.as_mut().and_then(|c| c.machine.take_held_offer());
                if let Some(offer) = held {
                    self.answer_offer(offer).await;
                }
            }
        }
    }

    async fn open_transport(&mut self, tracks: Vec<LocalTrack>) -> Result<(), TransportError> {
        let Some(call) = self.call.as_mut() else {
            tracks.iter().for_each(LocalTrack::stop);
            return Ok(());
        };

        let generation = call.generation;
        let tx = self.internal_tx.clone();
        let events = TransportEvents::new(move |event| {
            let _ = tx.send(Internal::Transport { generation, event });
        });

        let peer = match self.transports.create(&self.config, events).await {
            Ok(peer) => peer,
            Err(e) => {
                tracks.iter().for_each(LocalTrack::stop);
                return Err(e);
            }
        };

        let mut transport = TransportSession::new(peer);
        let mut pending = tracks.into_iter();
        let mut result = Ok(());
        for track in pending.by_ref() {
            if let Err(e) = transport.add_local_track(track.clone()).await {
                track.stop();
                result = Err(e);
                break;
            }
        }
        pending.for_each(|track| track.stop());

        // Auch bei Fehler übernehmen, damit der Teardown sie schließt
        call.transport = Some(transport);
        result
    }

    async fn prepare_offer(&mut self) -> Result<(), TransportError> {
        let Some(call) = self.call.as_mut() else {
            return Ok(());
        };
        let Some(transport) = call.transport.as_ref() else {
            return Ok(());
        };

        let offer = transport.create_offer().await?;
        let release = call.machine.offer_built(offer);

        if !call.call_request_sent {
            call.call_request_sent = true;
            self.outbox.call_request(call.machine.session()).await;
        }
        if let Some(offer) = release {
            self.outbox
                .signal(call.machine.session(), SignalKind::Offer, offer)
                .await;
        }
        Ok(())
    }

    async fn track_ready(
        &mut self,
        purpose: TrackPurpose,
        result: Result<LocalTrack, DeviceError>,
        reply: Option<TrackReply>,
    ) {
        let track = match result {
            Ok(track) => track,
            Err(e) => {
                tracing::warn!("Failed to open track: {}", e);
                self.emit(CallEvent::Error(e.to_string()));
                if matches!(purpose, TrackPurpose::ScreenShareRevert) {
                    if let Err(e) = self.drop_screen_track().await {
                        tracing::warn!("Failed to remove screen track: {}", e);
                    }
                }
                reply_to(reply, Err(e.into()));
                return;
            }
        };

        // Kamerawechsel während der Bildschirmfreigabe: nur die Auswahl merken
        if self.is_screen_sharing() {
            match &purpose {
                TrackPurpose::Switch {
                    kind: TrackKind::Video,
                    device_id,
                } => {
                    track.stop();
                    self.devices
                        .commit_selection(TrackKind::Video, Some(device_id.clone()));
                    self.publish_devices();
                    reply_to(reply, Ok(()));
                    return;
                }
                TrackPurpose::Facing(switch) => {
                    track.stop();
                    self.devices
                        .commit_facing(switch.facing, switch.constraints.device_id.clone());
                    self.publish_devices();
                    reply_to(reply, Ok(()));
                    return;
                }
                _ => {}
            }
        }

        let state = self.current_state();
        let track_id = track.id().to_string();
        let ended = track.ended();
        let result = match self.call.as_mut().and_then(|c| c.transport.as_mut()) {
            Some(transport) => transport.replace_track(track).await.map_err(CallError::from),
            None => {
                track.stop();
                Err(CallError::InvalidState(state))
            }
        };

        match (purpose, &result) {
            (TrackPurpose::Switch { kind, device_id }, Ok(())) => {
                self.devices.commit_selection(kind, Some(device_id));
                self.publish_devices();
            }
            (TrackPurpose::Facing(switch), Ok(())) => {
                self.devices
                    .commit_facing(switch.facing, switch.constraints.device_id);
                self.publish_devices();
            }
            (TrackPurpose::ScreenShare, Ok(())) => {
                self.watch_screen_track(track_id, ended);
                self.set_screen_sharing(true);
            }
            (TrackPurpose::ScreenShareRevert, Ok(())) => self.set_screen_sharing(false),
            (TrackPurpose::Camera { device_id }, Ok(())) => {
                if device_id.is_some() {
                    self.devices.commit_selection(TrackKind::Video, device_id);
                    self.publish_devices();
                }
                self.emit(CallEvent::TrackEnabledChanged {
                    kind: TrackKind::Video,
                    enabled: true,
                });
            }
            (TrackPurpose::ScreenShareRevert, Err(e)) => {
                tracing::warn!("Camera revert failed, removing screen track: {}", e);
                if let Err(e) = self.drop_screen_track().await {
                    tracing::warn!("Failed to remove screen track: {}", e);
                }
            }
            (_, Err(e)) => self.emit(CallEvent::Error(e.to_string())),
        }

        reply_to(reply, result);
    }

    fn watch_screen_track(&self, track_id: String, mut ended: watch::Receiver<bool>) {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            if ended.wait_for(|ended| *ended).await.is_ok() {
                let _ = tx.send(Internal::ScreenShareEnded {
                    generation,
                    track_id,
                });
            }
        });
    }

    async fn screen_share_ended(&mut self, track_id: &str) {
        let current = self
            .live_call()
            .and_then(|c| c.transport.as_ref())
            .and_then(|t| t.local_track(TrackKind::Video))
            .is_some_and(|t| t.id() == track_id && t.origin() == TrackOrigin::Screen);

        if current {
            tracing::info!("Screen share ended by its source");
            self.stop_screen_share(None).await;
        }
    }

    async fn transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let ready = self
                    .call
                    .as_mut()
                    .and_then(|c| c.machine.local_candidate(candidate));
                match ready {
                    Some(candidate) => self.send_signal(SignalKind::Candidate, candidate).await,
                    None => tracing::debug!("Buffered local ICE candidate"),
                }
            }
            TransportEvent::RemoteTrack(info) => {
                if let Some(transport) = self.call.as_mut().and_then(|c| c.transport.as_mut()) {
                    transport.remote_track_arrived(info.clone());
                }
                self.emit(CallEvent::RemoteTrackAvailable(info));
            }
            TransportEvent::StateChanged(TransportState::Connected) => self.connected(),
            TransportEvent::StateChanged(TransportState::Failed) => {
                self.fail("Peer connection failed".to_string()).await;
            }
            TransportEvent::StateChanged(TransportState::Disconnected | TransportState::Closed) => {
                tracing::info!("Peer connection lost");
                self.finish(CallState::Ended, Some(CallStatus::Dropped)).await;
            }
            TransportEvent::StateChanged(_) => {}
        }
    }

    fn connected(&mut self) {
        if self.current_state() != CallState::Negotiating {
            return;
        }
        let generation = self.generation;

        self.ring.stop();
        self.transition(CallState::Connected);

        let tx = self.internal_tx.clone();
        self.timer.start_duration(move |elapsed| {
            let _ = tx.send(Internal::DurationTick {
                generation,
                elapsed,
            });
        });
        self.shared.write().connected_at = self.timer.started_at();
        self.ring.surface_window();
    }

    async fn ring_timeout(&mut self) {
        if !self.current_state().is_ringing() {
            return;
        }
        tracing::info!("No answer within {:?}, ending call", self.config.ring_timeout);
        self.finish(CallState::Ended, Some(CallStatus::Timeout)).await;
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    fn live_call(&self) -> Option<&ActiveCall> {
        self.call.as_ref().filter(|c| c.is_live())
    }

    fn current_state(&self) -> CallState {
        self.call
            .as_ref()
            .map(|c| c.machine.state())
            .unwrap_or(CallState::Idle)
    }

    fn role(&self) -> CallRole {
        self.call
            .as_ref()
            .map(|c| c.machine.role())
            .unwrap_or(CallRole::Initiator)
    }

    fn is_screen_sharing(&self) -> bool {
        self.live_call()
            .and_then(|c| c.transport.as_ref())
            .is_some_and(|t| t.is_screen_sharing())
    }

    /// Legt eine neue Session an und gibt ihre Generation zurück
    fn begin(&mut self, session: CallSession) -> u64 {
        self.generation += 1;
        {
            let mut shared = self.shared.write();
            shared.session = Some(session.clone());
            shared.connected_at = None;
            shared.final_duration = None;
            shared.screen_sharing = false;
        }
        self.call = Some(ActiveCall {
            generation: self.generation,
            machine: NegotiationMachine::new(session),
            transport: None,
            call_request_sent: false,
            torn_down: false,
        });
        self.generation
    }

    fn transition(&mut self, next: CallState) -> bool {
        let Some(call) = self.call.as_mut() else {
            return false;
        };
        if let Err(e) = call.machine.transition(next) {
            tracing::debug!("{}", e);
            return false;
        }

        let session = call.machine.session().clone();
        let room_id = session.room_id.clone();
        self.shared.write().session = Some(session);
        self.emit(CallEvent::StateChanged {
            room_id,
            state: next,
        });
        true
    }

    /// Beendet die Session mit `state`; meldet vorher `status` an die Gegenseite
    async fn finish(&mut self, state: CallState, status: Option<CallStatus>) {
        let Some(call) = self.live_call() else {
            return;
        };
        if let Some(status) = status {
            self.outbox.status(call.machine.session(), status).await;
        }
        self.transition(state);
        self.teardown().await;
    }

    async fn fail(&mut self, message: String) {
        tracing::error!("{}", message);
        self.emit(CallEvent::Error(message));
        self.finish(CallState::Error, Some(CallStatus::Dropped)).await;
    }

    /// Gibt alle Ressourcen der Session frei (mehrfach aufrufbar)
    async fn teardown(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.torn_down {
            return;
        }
        call.torn_down = true;

        let duration = self.timer.elapsed();
        self.timer.cancel();
        self.ring.stop();
        call.machine.discard_candidates();
        if let Some(mut transport) = call.transport.take() {
            transport.close().await;
        }

        {
            let mut shared = self.shared.write();
            shared.connected_at = None;
            shared.final_duration = duration;
            shared.screen_sharing = false;
        }
        tracing::info!("Call {} torn down", call.machine.session().room_id);
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn plan_acquisition(&mut self, media_kind: MediaKind) -> Result<Acquisition, DeviceError> {
        self.refresh_devices().await?;
        self.devices.acquisition(media_kind)
    }

    fn arm_ring_timeout(&mut self, generation: u64) {
        let tx = self.internal_tx.clone();
        self.timer.start_ring_timeout(self.config.ring_timeout, move || {
            let _ = tx.send(Internal::RingTimeout { generation });
        });
    }

    fn spawn_media(&self, generation: u64, acquisition: Acquisition) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = acquisition.run().await;
            if let Err(mpsc::error::SendError(event)) =
                tx.send(Internal::MediaReady { generation, result })
            {
                event.release(CallState::Ended);
            }
        });
    }

    fn spawn_track<F>(&self, purpose: TrackPurpose, open: F, reply: Option<TrackReply>)
    where
        F: Future<Output = Result<LocalTrack, DeviceError>> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = open.await;
            let event = Internal::TrackReady {
                generation,
                purpose,
                result,
                reply,
            };
            if let Err(mpsc::error::SendError(event)) = tx.send(event) {
                event.release(CallState::Ended);
            }
        });
    }

    async fn send_status(&self, status: CallStatus) {
        if let Some(call) = &self.call {
            self.outbox.status(call.machine.session(), status).await;
        }
    }

    async fn send_signal(&self, kind: SignalKind, payload: String) {
        if let Some(call) = &self.call {
            self.outbox.signal(call.machine.session(), kind, payload).await;
        }
    }

    fn set_screen_sharing(&self, sharing: bool) {
        self.shared.write().screen_sharing = sharing;
        self.emit(CallEvent::ScreenShareChanged(sharing));
    }

    fn publish_devices(&self) {
        let list = self.devices.list().clone();
        self.shared.write().devices = list.clone();
        self.emit(CallEvent::DeviceListChanged(list));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
