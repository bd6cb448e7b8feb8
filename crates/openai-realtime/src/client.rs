use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub mod config;
mod consts;
mod utils;

type ClientTx = tokio::sync::mpsc::Sender<String>;
type ServerTx = tokio::sync::broadcast::Sender<ServerMessage>;
pub type ServerRx = tokio::sync::broadcast::Receiver<ServerMessage>;

/// What the socket delivers upward. Frames stay raw JSON text; classifying them is the
/// caller's job.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Text(String),
    Closed { reason: Option<String> },
}

// Contains the capacity for channels, client/server transmitters, configuration,
// and the handles of the two socket pump tasks.
pub struct Client {
    capacity: usize,
    config: config::Config,
    c_tx: Option<ClientTx>,
    s_tx: ServerTx,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    fn new(capacity: usize, config: config::Config) -> Self {
        let (s_tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            capacity,
            config,
            c_tx: None,
            s_tx,
            tasks: Vec::new(),
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.c_tx.is_some() {
            return Err(anyhow::anyhow!("already connected"));
        }

        let request = utils::build_request(&self.config)?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut write, mut read) = ws_stream.split();

        let (c_tx, mut c_rx) = tokio::sync::mpsc::channel::<String>(self.capacity);
        self.c_tx = Some(c_tx);

        // Writer: drains outbound frames in submission order.
        let writer = tokio::spawn(async move {
            while let Some(text) = c_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    tracing::error!("failed to send message: {}", e);
                    break;
                }
            }
            if let Err(e) = write.close().await {
                tracing::debug!("socket close after writer shutdown failed: {}", e);
            }
        });

        let s_tx = self.s_tx.clone();
        // Reader: forwards text frames and reports the close exactly once.
        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(message) = read.next().await {
                let message = match message {
                    Err(e) => {
                        tracing::error!("failed to read message: {}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                    Ok(message) => message,
                };
                match message {
                    Message::Text(text) => {
                        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                            tracing::debug!(
                                "received message: {}, id={}",
                                json.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
                                json.get("event_id").and_then(|v| v.as_str()).unwrap_or("unknown")
                            );
                        }
                        if s_tx.send(ServerMessage::Text(text)).is_err() {
                            tracing::debug!("no subscribers for server message");
                        }
                    }
                    Message::Binary(bin) => {
                        tracing::warn!("unexpected binary message: {} bytes", bin.len());
                    }
                    Message::Close(frame) => {
                        tracing::info!("connection closed: {:?}", frame);
                        reason = frame.map(|f| f.reason.to_string());
                        break;
                    }
                    _ => {}
                }
            }
            if let Err(e) = s_tx.send(ServerMessage::Closed { reason }) {
                tracing::debug!("failed to send close event: {}", e);
            }
        });

        self.tasks = vec![writer, reader];
        Ok(())
    }

    /// Subscribe to inbound frames. Subscriptions survive only as long as this client.
    pub fn server_events(&self) -> ServerRx {
        self.s_tx.subscribe()
    }

    /// Queue one raw JSON frame for the socket.
    pub async fn send_text(&self, text: String) -> Result<()> {
        match self.c_tx {
            Some(ref tx) => {
                tx.send(text).await?;
                Ok(())
            }
            None => Err(anyhow::anyhow!("not connected yet")),
        }
    }

    /// Serialize and queue a typed client event.
    pub async fn send_client_event(&self, event: crate::types::ClientEvent) -> Result<()> {
        self.send_text(serde_json::to_string(&event)?).await
    }

    /// Close the writer, which closes the socket, and stop both pump tasks.
    pub fn disconnect(&mut self) {
        self.c_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// Public function to create a client with specific config and connect.
pub async fn connect_with_config(capacity: usize, config: config::Config) -> Result<Client> {
    let mut client = Client::new(capacity, config);
    client.connect().await?;
    Ok(client)
}

// Public function to connect with default channel capacity.
pub async fn connect(config: config::Config) -> Result<Client> {
    connect_with_config(1024, config).await
}
