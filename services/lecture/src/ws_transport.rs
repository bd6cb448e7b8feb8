use anyhow::{Context, Result};
use async_trait::async_trait;
use lecture_core::transport::{ConnectionState, RealtimeCredential, Transport, TransportEvent};
use openai_realtime::types::ClientEvent;
use openai_realtime::types::events::client::InputAudioBufferClearEvent;
use openai_realtime::{Client, ServerMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// `Transport` over the realtime WebSocket endpoint.
///
/// Audio capture and playback are device concerns outside this crate; the microphone and
/// remote-audio switches are kept as flags, and turning the microphone off also drops any
/// speech the server has buffered but not yet transcribed.
pub struct WebSocketTransport {
    base_url: String,
    events: broadcast::Sender<TransportEvent>,
    client: Mutex<Option<Client>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    microphone_enabled: AtomicBool,
    remote_muted: AtomicBool,
}

impl WebSocketTransport {
    pub fn new(base_url: &str) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            base_url: base_url.to_string(),
            events,
            client: Mutex::new(None),
            forwarder: Mutex::new(None),
            microphone_enabled: AtomicBool::new(false),
            remote_muted: AtomicBool::new(false),
        }
    }

    pub fn microphone_enabled(&self) -> bool {
        self.microphone_enabled.load(Ordering::Relaxed)
    }

    pub fn remote_muted(&self) -> bool {
        self.remote_muted.load(Ordering::Relaxed)
    }

    fn publish_state(&self, state: ConnectionState) {
        if self.events.send(TransportEvent::ConnectionState(state)).is_err() {
            tracing::debug!("no subscribers for connection state");
        }
    }

    /// Relay socket frames as transport events until the socket closes.
    fn spawn_forwarder(&self, mut server_rx: openai_realtime::ServerRx) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match server_rx.recv().await {
                    Ok(ServerMessage::Text(text)) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Ok(ServerMessage::Closed { reason }) => {
                        let state = match reason {
                            Some(reason) if !reason.is_empty() => ConnectionState::Failed(reason),
                            _ => ConnectionState::Disconnected,
                        };
                        let _ = events.send(TransportEvent::ConnectionState(state));
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("transport forwarder lagged, {} frames dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, credential: &RealtimeCredential) -> Result<()> {
        self.disconnect().await?;
        self.publish_state(ConnectionState::Connecting);

        let config = openai_realtime::Config::builder()
            .with_base_url(&self.base_url)
            .with_credential(credential.secret.clone())
            .with_model(&credential.model)
            .build();
        let client = match openai_realtime::connect(config).await {
            Ok(client) => client,
            Err(e) => {
                self.publish_state(ConnectionState::Failed(e.to_string()));
                return Err(e).context("failed to open realtime socket");
            }
        };

        let forwarder = self.spawn_forwarder(client.server_events());
        *self.forwarder.lock().await = Some(forwarder);
        *self.client.lock().await = Some(client);
        tracing::info!(model = %credential.model, "realtime socket connected");
        self.publish_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            forwarder.abort();
        }
        let previous = self.client.lock().await.take();
        if let Some(mut client) = previous {
            client.disconnect();
            tracing::info!("realtime socket closed");
            self.publish_state(ConnectionState::Disconnected);
        }
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        match self.client.lock().await.as_ref() {
            Some(client) => client.send_text(text).await,
            None => Err(anyhow::anyhow!("realtime socket is not connected")),
        }
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<()> {
        let was = self.microphone_enabled.swap(enabled, Ordering::Relaxed);
        if was == enabled {
            return Ok(());
        }
        tracing::debug!(enabled, "microphone");
        if !enabled {
            if let Some(client) = self.client.lock().await.as_ref() {
                client
                    .send_client_event(ClientEvent::InputAudioBufferClear(
                        InputAudioBufferClearEvent::new(),
                    ))
                    .await
                    .context("failed to clear buffered input audio")?;
            }
        }
        Ok(())
    }

    async fn set_remote_audio_muted(&self, muted: bool) -> Result<()> {
        self.remote_muted.store(muted, Ordering::Relaxed);
        tracing::debug!(muted, "remote audio");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
