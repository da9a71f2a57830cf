//! Signaling Module - Relay-Anbindung für die Call Engine
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - Wire-Format der Relay-Frames (SignalCodec)
//! - WebSocket-Verbindung aufbauen und halten
//! - Eingehende Envelopes und Benachrichtigungen weiterleiten
//!

mod client;
mod messages;

pub use client::{RelayClient, SignalingChannel, SignalingError};
pub use messages::*;
