use crate::coordinator::{ClientError, Outbound};
use futures_util::{SinkExt, StreamExt};
use parley_shared::{ClientMessage, ServerMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Websocket connection to the host, reconnecting in the background.
pub struct BackendClient {
    tx: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

impl BackendClient {
    pub fn new(
        ws_url: String,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<ServerMessage>,
        mpsc::UnboundedReceiver<ConnectionStatus>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (status_tx, status_rx) = mpsc::unbounded_channel::<ConnectionStatus>();
        let connected = Arc::new(AtomicBool::new(false));

        let client = Self {
            tx,
            connected: connected.clone(),
        };

        tokio::spawn(async move {
            loop {
                let _ = status_tx.send(ConnectionStatus::Connecting);
                debug!("Attempting to connect to {}", &ws_url);

                match connect_async(ws_url.as_str()).await {
                    Ok((ws_stream, _)) => {
                        info!("Connected to host");
                        connected.store(true, Ordering::SeqCst);
                        let _ = status_tx.send(ConnectionStatus::Connected);

                        let (mut write, mut read) = ws_stream.split();

                        loop {
                            tokio::select! {
                                outgoing = rx.recv() => {
                                    let Some(text) = outgoing else {
                                        debug!("Client dropped, closing connection");
                                        connected.store(false, Ordering::SeqCst);
                                        let _ = write.send(Message::Close(None)).await;
                                        return;
                                    };
                                    debug!("Sending client message ({} bytes)", text.len());
                                    if let Err(e) = write.send(Message::Text(text)).await {
                                        error!("Failed to send message: {}", e);
                                        break;
                                    }
                                }
                                incoming = read.next() => {
                                    match incoming {
                                        Some(Ok(Message::Text(text))) => {
                                            match serde_json::from_str::<ServerMessage>(&text) {
                                                Ok(event) => {
                                                    if event_tx.send(event).is_err() {
                                                        debug!("Event receiver dropped");
                                                        connected.store(false, Ordering::SeqCst);
                                                        return;
                                                    }
                                                }
                                                Err(e) => {
                                                    error!("Failed to parse server message: {}", e);
                                                    error!("Raw text was: {}", text);
                                                }
                                            }
                                        }
                                        Some(Ok(Message::Close(_))) | None => {
                                            warn!("WebSocket connection closed");
                                            break;
                                        }
                                        Some(Err(e)) => {
                                            error!("WebSocket error: {}", e);
                                            break;
                                        }
                                        Some(Ok(_)) => {}
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to connect: {}", e);
                        let _ = status_tx.send(ConnectionStatus::Error(e.to_string()));
                    }
                }

                connected.store(false, Ordering::SeqCst);
                let _ = status_tx.send(ConnectionStatus::Disconnected);

                // anything queued for the old connection belongs to sessions
                // that have already been failed locally
                let mut stale = 0;
                while rx.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    warn!("Discarded {} message(s) queued for a lost connection", stale);
                }

                warn!("Reconnecting in {} seconds...", RECONNECT_DELAY.as_secs());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        (client, event_rx, status_rx)
    }
}

impl Outbound for BackendClient {
    fn is_available(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn post(&self, message: ClientMessage) -> Result<(), ClientError> {
        if !self.is_available() {
            return Err(ClientError::ChannelUnavailable);
        }
        let json = serde_json::to_string(&message)?;
        self.tx.send(json).map_err(|_| ClientError::ChannelUnavailable)
    }
}
