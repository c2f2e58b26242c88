use crate::correlator::{run_test, run_vision};
use crate::provider::Provider;
use crate::registry::{SessionRegistry, StreamRequest};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parley_shared::{ClientMessage, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Routes client messages of one connection. Streaming requests go to the
/// session registry; tests and image analyses are answered by spawned tasks.
pub struct Dispatcher {
    provider: Arc<dyn Provider>,
    registry: SessionRegistry,
    events: mpsc::UnboundedSender<ServerMessage>,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn Provider>, events: mpsc::UnboundedSender<ServerMessage>) -> Self {
        let registry = SessionRegistry::new(provider.clone(), events.clone());
        Self {
            provider,
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, message: ClientMessage) {
        match message {
            ClientMessage::SendMessage {
                conversation_id,
                message_id,
                model_config,
                messages,
            } => {
                self.registry
                    .start(StreamRequest {
                        conversation_id,
                        message_id,
                        model_config,
                        messages,
                    })
                    .await;
            }
            ClientMessage::CancelStream { message_id } => {
                self.registry.cancel(message_id).await;
            }
            ClientMessage::TestConnection {
                request_id,
                model_config,
            } => {
                info!(%request_id, provider = %model_config.provider, "Test connection requested");
                let provider = self.provider.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = run_test(provider.as_ref(), request_id, &model_config).await;
                    let _ = events.send(ServerMessage::TestResult(result));
                });
            }
            ClientMessage::AnalyzeImage {
                request_id,
                model_config,
                image_url,
                prompt,
            } => {
                info!(%request_id, image_bytes = image_url.len(), "Image analysis requested");
                let provider = self.provider.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result =
                        run_vision(provider.as_ref(), request_id, &model_config, &image_url, &prompt).await;
                    let _ = events.send(ServerMessage::VisionResult(result));
                });
            }
        }
    }

    /// The channel is gone: nothing can be delivered any more.
    pub async fn close(&self) {
        self.registry.shutdown().await;
    }
}

pub async fn handle_socket(socket: WebSocket, provider: Arc<dyn Provider>) {
    info!("=== NEW WEBSOCKET CONNECTION ESTABLISHED ===");

    let (mut sink, mut stream) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let dispatcher = Dispatcher::new(provider, events_tx);

    // single writer keeps per-session event order intact on the wire
    let writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        error!("Failed to send server message: {}", e);
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize server message: {}", e),
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    debug!(kind = message_kind(&message), "Client message received");
                    dispatcher.dispatch(message).await;
                }
                Err(e) => {
                    warn!("Failed to parse client message: {}", e);
                }
            },
            Ok(Message::Close(_)) => {
                info!("Client closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    dispatcher.close().await;
    drop(dispatcher);
    writer.abort();
    info!("=== WEBSOCKET CONNECTION CLOSED ===");
}

fn message_kind(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::SendMessage { .. } => "send_message",
        ClientMessage::CancelStream { .. } => "cancel_stream",
        ClientMessage::TestConnection { .. } => "test_connection",
        ClientMessage::AnalyzeImage { .. } => "analyze_image",
    }
}
