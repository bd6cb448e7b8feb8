use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use secrecy::SecretString;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
}

/// Everything a transport reports upward. Messages are raw JSON text; the protocol
/// adapter decides what they mean.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionState(ConnectionState),
    Message(String),
}

/// Short-lived secret for one realtime session, plus the model it was minted for.
#[derive(Debug, Clone)]
pub struct RealtimeCredential {
    pub secret: SecretString,
    pub model: String,
}

// The media channel to the realtime model. Audio capture and playback live behind
// this boundary; the orchestrator only ever sees text events and connection changes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, credential: &RealtimeCredential) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Deliver one JSON event to the model. Only called while the channel is writable.
    async fn send_text(&self, text: String) -> Result<()>;

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<()>;

    async fn set_remote_audio_muted(&self, muted: bool) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
