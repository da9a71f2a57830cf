//! Message Types und Wire-Codec für den Signaling-Relay
//!
//! Der Relay spricht JSON-Frames der Form `{"type": ..., "data": {...}}`.
//! Ausgehende Frames tragen einen numerischen Request-Typ, eingehende
//! Frames einen String-Namen. Dieses Modul übersetzt zwischen dem Wire-Format
//! und den typsicheren Strukturen, mit denen die Call Engine arbeitet.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed relay frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Relay frame '{0}' carries no data")]
    MissingData(String),

    #[error("Missing field '{field}' in '{frame}' frame")]
    MissingField { frame: String, field: &'static str },

    #[error("Unknown signal type: {0}")]
    UnknownSignalType(String),
}

// ============================================================================
// SIGNAL ENVELOPE
// ============================================================================

/// Art eines Signaling-Envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Leave,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Leave => "leave",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "candidate" => Some(SignalKind::Candidate),
            "leave" => Some(SignalKind::Leave),
            _ => None,
        }
    }
}

/// Ein Signaling-Envelope zwischen den beiden Teilnehmern
///
/// `payload` ist die serialisierte Session Description bzw. der
/// serialisierte ICE Candidate (JSON-String).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub session_id: String,
    pub sender_id: String,
    pub target_id: String,
    pub kind: SignalKind,
    pub payload: String,
    pub is_video: bool,
}

// ============================================================================
// CALL STATUS
// ============================================================================

/// Status-Codes, die beim Auflegen an die Gegenseite gemeldet werden
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Timeout,
    Rejected,
    Accepted,
    Dropped,
    Cancelled,
}

impl CallStatus {
    pub fn code(self) -> i32 {
        match self {
            CallStatus::Timeout => -1,
            CallStatus::Rejected => 0,
            CallStatus::Accepted => 1,
            CallStatus::Dropped => 2,
            CallStatus::Cancelled => 3,
        }
    }
}

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

const REQUEST_HEARTBEAT: u8 = 2;
const REQUEST_CALL: u8 = 5;
const REQUEST_CALL_RESPONSE: u8 = 6;
const REQUEST_SIGNAL: u8 = 14;

/// Alle Nachrichten, die die Engine an den Relay schickt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Heartbeat,
    CallRequest {
        room_id: String,
        target_id: String,
        is_video: bool,
    },
    CallResponse {
        room_id: String,
        remote_id: String,
        status: CallStatus,
    },
    Signal(SignalEnvelope),
}

#[derive(Serialize)]
struct OutboundFrame<T: Serialize> {
    #[serde(rename = "type")]
    msg_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallRequestData<'a> {
    room_id: &'a str,
    target_uid: &'a str,
    is_video: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallResponseData<'a> {
    caller_uid: &'a str,
    room_id: &'a str,
    accepted: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignalData<'a> {
    caller_uid: &'a str,
    room_id: &'a str,
    signal: &'a str,
    signal_type: &'static str,
    target_uid: &'a str,
    video: bool,
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Out-of-band Benachrichtigungen des Relays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayNotificationKind {
    CallRequested,
    CallAccepted,
    CallRejected,
    RoomClosed,
    Dropped,
    Cancelled,
    Timeout,
}

impl RelayNotificationKind {
    fn from_frame_type(frame_type: &str) -> Option<Self> {
        match frame_type {
            "VideoCallRequest" => Some(Self::CallRequested),
            "CallAccepted" => Some(Self::CallAccepted),
            "CallRejected" => Some(Self::CallRejected),
            "RoomClosed" => Some(Self::RoomClosed),
            "DROPPED" => Some(Self::Dropped),
            "CANCEL" => Some(Self::Cancelled),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }
}

/// Benachrichtigung mit den Feldern, die der Relay mitliefert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNotification {
    pub kind: RelayNotificationKind,
    pub room_id: Option<String>,
    pub from_id: Option<String>,
    pub is_video: bool,
}

/// Alle eingehenden Nachrichten, die für die Engine relevant sind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Signal(SignalEnvelope),
    Notification(RelayNotification),
}

// ============================================================================
// SIGNAL CODEC
// ============================================================================

/// Übersetzt zwischen Relay-Frames und typisierten Nachrichten
pub struct SignalCodec;

impl SignalCodec {
    /// Serialisiert eine ausgehende Nachricht in einen Text-Frame
    pub fn encode(message: &OutboundMessage) -> Result<String, CodecError> {
        let text = match message {
            OutboundMessage::Heartbeat => serde_json::to_string(&OutboundFrame::<()> {
                msg_type: REQUEST_HEARTBEAT,
                data: None,
            })?,
            OutboundMessage::CallRequest {
                room_id,
                target_id,
                is_video,
            } => serde_json::to_string(&OutboundFrame {
                msg_type: REQUEST_CALL,
                data: Some(CallRequestData {
                    room_id,
                    target_uid: target_id,
                    is_video: *is_video,
                }),
            })?,
            OutboundMessage::CallResponse {
                room_id,
                remote_id,
                status,
            } => serde_json::to_string(&OutboundFrame {
                msg_type: REQUEST_CALL_RESPONSE,
                data: Some(CallResponseData {
                    caller_uid: remote_id,
                    room_id,
                    accepted: status.code(),
                }),
            })?,
            OutboundMessage::Signal(envelope) => serde_json::to_string(&OutboundFrame {
                msg_type: REQUEST_SIGNAL,
                data: Some(SignalData {
                    caller_uid: &envelope.sender_id,
                    room_id: &envelope.session_id,
                    signal: &envelope.payload,
                    signal_type: envelope.kind.as_str(),
                    target_uid: &envelope.target_id,
                    video: envelope.is_video,
                }),
            })?,
        };
        Ok(text)
    }

    /// Parst einen eingehenden Text-Frame
    ///
    /// Frames, die nichts mit Anrufen zu tun haben (Chat, Presence, Pong),
    /// ergeben `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<InboundMessage>, CodecError> {
        let frame: Value = serde_json::from_str(text)?;
        let frame_type = match frame.get("type").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => return Ok(None),
        };
        let data = frame.get("data").filter(|d| !d.is_null());

        if frame_type == "WEBRTC_SIGNAL" {
            let data = data.ok_or_else(|| CodecError::MissingData(frame_type.clone()))?;
            return Self::decode_signal(&frame_type, data).map(|e| Some(InboundMessage::Signal(e)));
        }

        let Some(kind) = RelayNotificationKind::from_frame_type(&frame_type) else {
            return Ok(None);
        };

        let empty = Value::Null;
        let data = data.unwrap_or(&empty);
        Ok(Some(InboundMessage::Notification(RelayNotification {
            kind,
            room_id: string_field(data, &["roomId"]),
            from_id: string_field(data, &["callerUid", "callerId", "senderId", "uid"]),
            is_video: video_flag(data),
        })))
    }

    fn decode_signal(frame_type: &str, data: &Value) -> Result<SignalEnvelope, CodecError> {
        let missing = |field| CodecError::MissingField {
            frame: frame_type.to_string(),
            field,
        };

        let signal_type = string_field(data, &["signalType"]).ok_or_else(|| missing("signalType"))?;
        let kind =
            SignalKind::parse(&signal_type).ok_or(CodecError::UnknownSignalType(signal_type))?;

        // Das Signal kommt normalerweise als JSON-String, manche Relays
        // liefern es bereits als Objekt aus
        let payload = match data.get("signal") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None if kind == SignalKind::Leave => String::new(),
            Some(Value::Null) | None => return Err(missing("signal")),
            Some(other) => other.to_string(),
        };

        Ok(SignalEnvelope {
            session_id: string_field(data, &["roomId"]).ok_or_else(|| missing("roomId"))?,
            sender_id: string_field(data, &["senderId", "callerUid", "callerId"]).unwrap_or_default(),
            target_id: string_field(data, &["targetUid"]).unwrap_or_default(),
            kind,
            payload,
            is_video: video_flag(data),
        })
    }
}

/// Liest das erste vorhandene Feld als String (IDs kommen teils als Zahl)
fn string_field(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match data.get(*key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn video_flag(data: &Value) -> bool {
    if let Some(flag) = ["video", "isVideo"]
        .iter()
        .find_map(|key| data.get(*key).and_then(Value::as_bool))
    {
        return flag;
    }
    data.get("mediaType").and_then(Value::as_str) == Some("VideoSignal")
}

// ============================================================================
// TESTS
// ============================================================================
