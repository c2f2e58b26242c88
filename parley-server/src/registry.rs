//! Host-side bookkeeping of in-flight streaming sessions.
//!
//! Each `MessageId` maps to at most one live session. The registry is the only
//! writer of that map and the only place that decides whether an event from a
//! provider task still belongs to a live session. Every transition (start,
//! cancel, forward, finish) runs as one critical section on the map, so a
//! chunk can never be emitted after its session's terminal event.

use crate::provider::{Provider, ProviderError, ProviderEvent};
use parley_shared::{timestamp_ms, ChatMessage, ErrorCode, MessageId, ModelConfig, ServerMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parameters of a `SendMessage` request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub conversation_id: u64,
    pub message_id: MessageId,
    pub model_config: ModelConfig,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug)]
struct StreamSession {
    generation: u64,
    cancel: CancellationToken,
    started_at: Instant,
}

enum Outcome {
    Done {
        finish_reason: Option<String>,
        total_tokens: Option<u32>,
    },
    Failed(ProviderError),
}

struct Inner {
    provider: Arc<dyn Provider>,
    events: mpsc::UnboundedSender<ServerMessage>,
    sessions: Mutex<HashMap<MessageId, StreamSession>>,
    next_generation: AtomicU64,
}

/// Streaming sessions of one client connection.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn Provider>, events: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                events,
                sessions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a session for `request.message_id`, replacing a live one with the
    /// same id. The replaced session is aborted without a terminal event of its
    /// own: its id now belongs to the new session, which emits the single
    /// terminal event for that id.
    pub async fn start(&self, request: StreamRequest) {
        let message_id = request.message_id;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        {
            let mut sessions = self.inner.sessions.lock().await;
            if let Some(previous) = sessions.remove(&message_id) {
                warn!(
                    message_id,
                    replaced_generation = previous.generation,
                    "Duplicate send for a live message id, cancelling the previous session"
                );
                previous.cancel.cancel();
            }
            sessions.insert(
                message_id,
                StreamSession {
                    generation,
                    cancel: cancel.clone(),
                    started_at: Instant::now(),
                },
            );
        }

        info!(
            message_id,
            generation,
            conversation_id = request.conversation_id,
            model = %request.model_config.model,
            messages = request.messages.len(),
            "Stream session started"
        );

        let registry = self.clone();
        tokio::spawn(async move {
            registry.run_session(request, generation, cancel).await;
        });
    }

    /// Cancels the live session for `message_id`. Returns `false` (and emits
    /// nothing) when there is none.
    pub async fn cancel(&self, message_id: MessageId) -> bool {
        let mut sessions = self.inner.sessions.lock().await;
        let Some(session) = sessions.remove(&message_id) else {
            debug!(message_id, "Cancel for an inactive message id ignored");
            return false;
        };

        session.cancel.cancel();
        self.emit(ServerMessage::StreamError {
            message_id,
            error: ProviderError::Cancelled.to_string(),
            code: Some(ErrorCode::Cancelled),
            provider_code: None,
            timestamp: timestamp_ms(),
        });
        info!(
            message_id,
            generation = session.generation,
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "Stream session cancelled"
        );
        true
    }

    /// Aborts every session silently; used when the channel itself is gone.
    pub async fn shutdown(&self) {
        let mut sessions = self.inner.sessions.lock().await;
        if !sessions.is_empty() {
            info!("Shutting down {} active stream session(s)", sessions.len());
        }
        for (_, session) in sessions.drain() {
            session.cancel.cancel();
        }
    }

    pub async fn active_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    pub async fn is_active(&self, message_id: MessageId) -> bool {
        self.inner.sessions.lock().await.contains_key(&message_id)
    }

    async fn run_session(&self, request: StreamRequest, generation: u64, cancel: CancellationToken) {
        let StreamRequest {
            message_id,
            model_config,
            messages,
            ..
        } = request;

        let mut rx = match self
            .inner
            .provider
            .stream_chat(&model_config, messages, cancel)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.finish(message_id, generation, Outcome::Failed(e)).await;
                return;
            }
        };

        while let Some(item) = rx.recv().await {
            match item {
                Ok(ProviderEvent::Delta(content)) => {
                    if !self.forward_chunk(message_id, generation, content).await {
                        debug!(message_id, generation, "Session no longer live, dropping provider output");
                        return;
                    }
                }
                Ok(ProviderEvent::Finished {
                    finish_reason,
                    total_tokens,
                }) => {
                    self.finish(
                        message_id,
                        generation,
                        Outcome::Done {
                            finish_reason,
                            total_tokens,
                        },
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    self.finish(message_id, generation, Outcome::Failed(e)).await;
                    return;
                }
            }
        }

        // provider hung up without a terminal item
        self.finish(
            message_id,
            generation,
            Outcome::Done {
                finish_reason: None,
                total_tokens: None,
            },
        )
        .await;
    }

    async fn forward_chunk(&self, message_id: MessageId, generation: u64, content: String) -> bool {
        let sessions = self.inner.sessions.lock().await;
        if !is_live(&sessions, message_id, generation) {
            return false;
        }
        self.emit(ServerMessage::StreamChunk {
            message_id,
            content,
            timestamp: timestamp_ms(),
        });
        true
    }

    async fn finish(&self, message_id: MessageId, generation: u64, outcome: Outcome) {
        let mut sessions = self.inner.sessions.lock().await;
        if !is_live(&sessions, message_id, generation) {
            debug!(message_id, generation, "Terminal event for a dead session suppressed");
            return;
        }
        let Some(session) = sessions.remove(&message_id) else {
            return;
        };
        let elapsed_ms = session.started_at.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Done {
                finish_reason,
                total_tokens,
            } => {
                info!(message_id, generation, elapsed_ms, ?finish_reason, ?total_tokens, "Stream session completed");
                self.emit(ServerMessage::StreamDone {
                    message_id,
                    finish_reason,
                    total_tokens,
                    timestamp: timestamp_ms(),
                });
            }
            Outcome::Failed(e) => {
                warn!(message_id, generation, elapsed_ms, code = %e.code(), "Stream session failed: {}", e);
                self.emit(ServerMessage::StreamError {
                    message_id,
                    error: e.to_string(),
                    code: Some(e.code()),
                    provider_code: e.provider_code(),
                    timestamp: timestamp_ms(),
                });
            }
        }
    }

    fn emit(&self, message: ServerMessage) {
        if self.inner.events.send(message).is_err() {
            debug!("Event channel closed, dropping server message");
        }
    }
}

fn is_live(sessions: &HashMap<MessageId, StreamSession>, message_id: MessageId, generation: u64) -> bool {
    sessions
        .get(&message_id)
        .is_some_and(|session| session.generation == generation)
}
