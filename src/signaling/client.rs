//! WebSocket Client für den Signaling-Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Read-Task dekodiert Frames und verteilt sie per Broadcast
//! - Write-Task leert die ausgehende Queue
//! - Heartbeat hält die Verbindung offen
//!
//! Die Call Engine kennt nur den `SignalingChannel` Trait, damit sie ohne
//! Netzwerk getestet werden kann.

use super::messages::{InboundMessage, OutboundMessage, SignalCodec};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING CHANNEL
// ============================================================================

/// Schmale Schnittstelle zum Relay: senden und eingehende Nachrichten abonnieren
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError>;

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage>;
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

/// WebSocket Client für die Relay-Kommunikation
pub struct RelayClient {
    relay_url: Url,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<InboundMessage>,
}

impl RelayClient {
    /// Verbindet mit dem Relay
    ///
    /// `token` wird als Query-Parameter angehängt, falls vorhanden.
    pub async fn connect(relay_url: &str, token: Option<&str>) -> Result<Arc<Self>, SignalingError> {
        let url = Self::build_url(relay_url, token)?;

        tracing::info!(
            "Connecting to signaling relay: {}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.path()
        );

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (event_tx, _) = broadcast::channel(100);
        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));

        // Read-Task starten
        let state_clone = Arc::clone(&state);
        let event_tx_clone = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match SignalCodec::decode(&text) {
                        Ok(Some(message)) => {
                            let _ = event_tx_clone.send(message);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::debug!("Dropping undecodable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            relay_url: url,
            state,
            tx,
            event_tx,
        }))
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !client.is_connected() {
                    tracing::info!("Heartbeat: relay disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = client.send(OutboundMessage::Heartbeat).await {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    /// Baut die WebSocket-URL (http → ws) inklusive Token
    fn build_url(relay_url: &str, token: Option<&str>) -> Result<Url, SignalingError> {
        let mut url =
            Url::parse(relay_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(SignalingError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidUrl(relay_url.to_string()))?;

        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }

        Ok(url)
    }
}

#[async_trait]
impl SignalingChannel for RelayClient {
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text =
            SignalCodec::encode(&message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("host", &self.relay_url.host_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
