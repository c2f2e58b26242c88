//! Client half of the streaming protocol.
//!
//! The coordinator tracks at most one streaming session (the id the UI is
//! currently rendering) plus a table of outstanding one-shot requests. Every
//! message coming back from the host goes through [`StreamCoordinator::handle_event`],
//! which routes it to the matching handler or drops it.

use parley_shared::{
    ChatMessage, ClientMessage, ErrorCode, MessageId, ModelConfig, ServerMessage, TestResult, VisionResult,
};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected to the host")]
    ChannelUnavailable,
    #[error("Failed to encode client message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where client messages go. Implemented by the websocket client and by a
/// plain channel sender.
pub trait Outbound {
    fn is_available(&self) -> bool;
    fn post(&self, message: ClientMessage) -> Result<(), ClientError>;
}

impl Outbound for mpsc::UnboundedSender<ClientMessage> {
    fn is_available(&self) -> bool {
        !self.is_closed()
    }

    fn post(&self, message: ClientMessage) -> Result<(), ClientError> {
        self.send(message).map_err(|_| ClientError::ChannelUnavailable)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub finish_reason: Option<String>,
    pub total_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub message: String,
    pub code: Option<ErrorCode>,
    pub provider_code: Option<String>,
}

impl StreamFailure {
    fn local(code: ErrorCode, message: &str) -> Self {
        Self {
            message: message.to_string(),
            code: Some(code),
            provider_code: None,
        }
    }
}

/// UI callbacks for one streaming session. Exactly one of `on_done` and
/// `on_error` is called, after which the handler is dropped.
pub trait StreamHandler: Send {
    /// `full` is everything received so far, `delta` included.
    fn on_chunk(&mut self, delta: &str, full: &str);
    fn on_done(&mut self, summary: StreamSummary);
    fn on_error(&mut self, failure: StreamFailure);
}

pub type TestCallback = Box<dyn FnOnce(TestResult) + Send>;
pub type VisionCallback = Box<dyn FnOnce(VisionResult) + Send>;

const CANCELLED_MESSAGE: &str = "Request cancelled by user";
const CHANNEL_UNAVAILABLE_MESSAGE: &str = "Not connected to the host";
const CHANNEL_LOST_MESSAGE: &str = "Connection to the host was lost";

struct ActiveStream {
    message_id: MessageId,
    content: String,
    handler: Box<dyn StreamHandler>,
}

pub struct StreamCoordinator<O: Outbound> {
    outbound: O,
    active: Option<ActiveStream>,
    pending_tests: HashMap<String, TestCallback>,
    pending_visions: HashMap<String, VisionCallback>,
}

impl<O: Outbound> StreamCoordinator<O> {
    pub fn new(outbound: O) -> Self {
        Self {
            outbound,
            active: None,
            pending_tests: HashMap::new(),
            pending_visions: HashMap::new(),
        }
    }

    pub fn outbound(&self) -> &O {
        &self.outbound
    }

    /// Starts streaming a reply for `message_id`. A session that is still
    /// being tracked is cancelled first. Re-sending the tracked id only
    /// releases the old handler locally: the host replaces that session
    /// without a terminal event, and a `cancel_stream` would kill the new one.
    pub fn send(
        &mut self,
        conversation_id: u64,
        message_id: MessageId,
        config: &ModelConfig,
        history: Vec<ChatMessage>,
        mut handler: Box<dyn StreamHandler>,
    ) -> Result<(), ClientError> {
        if !self.outbound.is_available() {
            warn!(message_id, "Send refused, channel unavailable");
            handler.on_error(StreamFailure::local(ErrorCode::ChannelUnavailable, CHANNEL_UNAVAILABLE_MESSAGE));
            return Err(ClientError::ChannelUnavailable);
        }

        if self.current_message_id() == Some(message_id) {
            if let Some(stream) = self.active.take() {
                Self::release_cancelled(stream);
            }
        } else {
            self.cancel();
        }

        let message = ClientMessage::SendMessage {
            conversation_id,
            message_id,
            model_config: config.clone(),
            messages: history,
        };
        if let Err(e) = self.outbound.post(message) {
            warn!(message_id, "Failed to post send_message: {}", e);
            handler.on_error(StreamFailure::local(ErrorCode::ChannelUnavailable, &e.to_string()));
            return Err(e);
        }

        info!(message_id, conversation_id, "Streaming session started");
        self.active = Some(ActiveStream {
            message_id,
            content: String::new(),
            handler,
        });
        Ok(())
    }

    /// Cancels the tracked session, if any. Its handler gets a single
    /// `cancelled` error right away; whatever the host still sends for that
    /// id is ignored.
    pub fn cancel(&mut self) -> bool {
        let Some(stream) = self.active.take() else {
            return false;
        };

        let message_id = stream.message_id;
        if let Err(e) = self.outbound.post(ClientMessage::CancelStream { message_id }) {
            debug!(message_id, "Could not post cancel_stream: {}", e);
        }
        Self::release_cancelled(stream);
        true
    }

    fn release_cancelled(mut stream: ActiveStream) {
        info!(
            message_id = stream.message_id,
            received = stream.content.len(),
            "Streaming session cancelled"
        );
        stream
            .handler
            .on_error(StreamFailure::local(ErrorCode::Cancelled, CANCELLED_MESSAGE));
    }

    /// Asks the host to verify `config`. Returns the request id; `on_result`
    /// is called once, either with the host's answer or with a local failure.
    pub fn test_connection(
        &mut self,
        config: &ModelConfig,
        on_result: impl FnOnce(TestResult) + Send + 'static,
    ) -> String {
        let request_id = format!("test-{}", Uuid::new_v4());

        if !self.outbound.is_available() {
            on_result(unavailable_test(&request_id, CHANNEL_UNAVAILABLE_MESSAGE));
            return request_id;
        }

        self.pending_tests.insert(request_id.clone(), Box::new(on_result));
        let message = ClientMessage::TestConnection {
            request_id: request_id.clone(),
            model_config: config.clone(),
        };
        if let Err(e) = self.outbound.post(message) {
            if let Some(callback) = self.pending_tests.remove(&request_id) {
                callback(unavailable_test(&request_id, &e.to_string()));
            }
        }
        request_id
    }

    /// Asks the host to describe an image. Same contract as
    /// [`test_connection`](Self::test_connection).
    pub fn analyze_image(
        &mut self,
        config: &ModelConfig,
        image_url: String,
        prompt: String,
        on_result: impl FnOnce(VisionResult) + Send + 'static,
    ) -> String {
        let request_id = format!("vision-{}", Uuid::new_v4());

        if !self.outbound.is_available() {
            on_result(unavailable_vision(&request_id, CHANNEL_UNAVAILABLE_MESSAGE));
            return request_id;
        }

        self.pending_visions.insert(request_id.clone(), Box::new(on_result));
        let message = ClientMessage::AnalyzeImage {
            request_id: request_id.clone(),
            model_config: config.clone(),
            image_url,
            prompt,
        };
        if let Err(e) = self.outbound.post(message) {
            if let Some(callback) = self.pending_visions.remove(&request_id) {
                callback(unavailable_vision(&request_id, &e.to_string()));
            }
        }
        request_id
    }

    pub fn handle_event(&mut self, event: ServerMessage) {
        match event {
            ServerMessage::StreamChunk { message_id, content, .. } => match self.active.as_mut() {
                Some(stream) if stream.message_id == message_id => {
                    stream.content.push_str(&content);
                    stream.handler.on_chunk(&content, &stream.content);
                }
                _ => debug!(message_id, "Dropping chunk for an untracked message"),
            },
            ServerMessage::StreamDone {
                message_id,
                finish_reason,
                total_tokens,
                ..
            } => {
                if let Some(mut stream) = self.take_if_tracked(message_id) {
                    info!(message_id, ?finish_reason, ?total_tokens, "Streaming session completed");
                    stream.handler.on_done(StreamSummary {
                        finish_reason,
                        total_tokens,
                    });
                }
            }
            ServerMessage::StreamError {
                message_id,
                error,
                code,
                provider_code,
                ..
            } => {
                if let Some(mut stream) = self.take_if_tracked(message_id) {
                    warn!(message_id, ?code, "Streaming session failed: {}", error);
                    stream.handler.on_error(StreamFailure {
                        message: error,
                        code,
                        provider_code,
                    });
                }
            }
            ServerMessage::TestResult(result) => match self.pending_tests.remove(&result.request_id) {
                Some(callback) => callback(result),
                None => debug!(request_id = %result.request_id, "Dropping unsolicited test result"),
            },
            ServerMessage::VisionResult(result) => match self.pending_visions.remove(&result.request_id) {
                Some(callback) => callback(result),
                None => debug!(request_id = %result.request_id, "Dropping unsolicited vision result"),
            },
        }
    }

    /// The transport went away. Everything in flight fails with
    /// `channel_unavailable`.
    pub fn channel_lost(&mut self) {
        if let Some(mut stream) = self.active.take() {
            warn!(message_id = stream.message_id, "Channel lost during streaming");
            stream
                .handler
                .on_error(StreamFailure::local(ErrorCode::ChannelUnavailable, CHANNEL_LOST_MESSAGE));
        }
        for (request_id, callback) in self.pending_tests.drain() {
            callback(unavailable_test(&request_id, CHANNEL_LOST_MESSAGE));
        }
        for (request_id, callback) in self.pending_visions.drain() {
            callback(unavailable_vision(&request_id, CHANNEL_LOST_MESSAGE));
        }
    }

    pub fn shutdown(&mut self) {
        self.cancel();
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn current_message_id(&self) -> Option<MessageId> {
        self.active.as_ref().map(|stream| stream.message_id)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending_tests.len() + self.pending_visions.len()
    }

    fn take_if_tracked(&mut self, message_id: MessageId) -> Option<ActiveStream> {
        match &self.active {
            Some(stream) if stream.message_id == message_id => self.active.take(),
            _ => {
                debug!(message_id, "Dropping terminal event for an untracked message");
                None
            }
        }
    }
}

fn unavailable_test(request_id: &str, message: &str) -> TestResult {
    TestResult {
        request_id: request_id.to_string(),
        success: false,
        message: message.to_string(),
        response_time_ms: None,
        error: Some(ErrorCode::ChannelUnavailable),
    }
}

fn unavailable_vision(request_id: &str, message: &str) -> VisionResult {
    VisionResult {
        request_id: request_id.to_string(),
        success: false,
        description: None,
        model: None,
        analysis_time_ms: 0,
        error: Some(message.to_string()),
        code: Some(ErrorCode::ChannelUnavailable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::timestamp_ms;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Chunk(String, String),
        Done(StreamSummary),
        Error(StreamFailure),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Call>>>);

    impl Recorder {
        fn handler(&self) -> Box<dyn StreamHandler> {
            Box::new(self.clone())
        }

        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().clone()
        }
    }

    impl StreamHandler for Recorder {
        fn on_chunk(&mut self, delta: &str, full: &str) {
            self.0.lock().unwrap().push(Call::Chunk(delta.to_string(), full.to_string()));
        }

        fn on_done(&mut self, summary: StreamSummary) {
            self.0.lock().unwrap().push(Call::Done(summary));
        }

        fn on_error(&mut self, failure: StreamFailure) {
            self.0.lock().unwrap().push(Call::Error(failure));
        }
    }

    fn config(api_key: &str) -> ModelConfig {
        ModelConfig {
            provider: "openai".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key: api_key.into(),
            model: "gpt-4o".into(),
            temperature: None,
            max_tokens: None,
            system_prompt: None,
        }
    }

    fn coordinator() -> (
        StreamCoordinator<mpsc::UnboundedSender<ClientMessage>>,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamCoordinator::new(tx), rx)
    }

    fn chunk(message_id: MessageId, content: &str) -> ServerMessage {
        ServerMessage::StreamChunk {
            message_id,
            content: content.into(),
            timestamp: timestamp_ms(),
        }
    }

    fn done(message_id: MessageId) -> ServerMessage {
        ServerMessage::StreamDone {
            message_id,
            finish_reason: Some("stop".into()),
            total_tokens: Some(4),
            timestamp: timestamp_ms(),
        }
    }

    fn cancelled(message_id: MessageId) -> ServerMessage {
        ServerMessage::StreamError {
            message_id,
            error: CANCELLED_MESSAGE.into(),
            code: Some(ErrorCode::Cancelled),
            provider_code: None,
            timestamp: timestamp_ms(),
        }
    }

    #[test]
    fn chunks_accumulate_and_done_releases_the_handler() {
        let (mut coordinator, mut rx) = coordinator();
        let recorder = Recorder::default();
        coordinator
            .send(1, 42, &config("key"), vec![ChatMessage::user("hi")], recorder.handler())
            .unwrap();

        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::SendMessage { message_id: 42, .. }));
        assert_eq!(coordinator.current_message_id(), Some(42));

        coordinator.handle_event(chunk(42, "Hel"));
        coordinator.handle_event(chunk(42, "lo!"));
        coordinator.handle_event(done(42));

        assert_eq!(
            recorder.calls(),
            vec![
                Call::Chunk("Hel".into(), "Hel".into()),
                Call::Chunk("lo!".into(), "Hello!".into()),
                Call::Done(StreamSummary {
                    finish_reason: Some("stop".into()),
                    total_tokens: Some(4),
                }),
            ]
        );
        assert!(!coordinator.is_streaming());
    }

    #[test]
    fn host_error_is_forwarded_with_codes() {
        let (mut coordinator, _rx) = coordinator();
        let recorder = Recorder::default();
        coordinator
            .send(1, 8, &config("key"), vec![], recorder.handler())
            .unwrap();

        coordinator.handle_event(chunk(8, "partial"));
        coordinator.handle_event(ServerMessage::StreamError {
            message_id: 8,
            error: "Incorrect API key provided".into(),
            code: Some(ErrorCode::ProviderRejected),
            provider_code: Some("invalid_api_key".into()),
            timestamp: timestamp_ms(),
        });

        let calls = recorder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls[1],
            Call::Error(StreamFailure {
                message: "Incorrect API key provided".into(),
                code: Some(ErrorCode::ProviderRejected),
                provider_code: Some("invalid_api_key".into()),
            })
        );
    }

    #[test]
    fn cancel_notifies_once_and_ignores_late_events() {
        let (mut coordinator, mut rx) = coordinator();
        let recorder = Recorder::default();
        coordinator
            .send(1, 9, &config("key"), vec![], recorder.handler())
            .unwrap();
        let _ = rx.try_recv();

        assert!(coordinator.cancel());
        assert!(!coordinator.cancel());
        assert_eq!(rx.try_recv().unwrap(), ClientMessage::CancelStream { message_id: 9 });

        coordinator.handle_event(chunk(9, "late"));
        coordinator.handle_event(cancelled(9));

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Error(f) if f.code == Some(ErrorCode::Cancelled)));
    }

    #[test]
    fn second_send_cancels_the_first() {
        let (mut coordinator, mut rx) = coordinator();
        let first = Recorder::default();
        let second = Recorder::default();

        coordinator.send(1, 1, &config("key"), vec![], first.handler()).unwrap();
        coordinator.send(1, 2, &config("key"), vec![], second.handler()).unwrap();

        let posted: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(posted[0], ClientMessage::SendMessage { message_id: 1, .. }));
        assert_eq!(posted[1], ClientMessage::CancelStream { message_id: 1 });
        assert!(matches!(posted[2], ClientMessage::SendMessage { message_id: 2, .. }));

        coordinator.handle_event(chunk(1, "old"));
        coordinator.handle_event(chunk(2, "new"));
        coordinator.handle_event(cancelled(1));
        coordinator.handle_event(done(2));

        assert_eq!(first.calls().len(), 1);
        assert!(matches!(&first.calls()[0], Call::Error(f) if f.code == Some(ErrorCode::Cancelled)));
        assert_eq!(second.calls()[0], Call::Chunk("new".into(), "new".into()));
        assert!(matches!(second.calls()[1], Call::Done(_)));
    }

    #[test]
    fn resending_the_tracked_id_does_not_post_a_cancel() {
        let (mut coordinator, mut rx) = coordinator();
        let first = Recorder::default();
        let second = Recorder::default();

        coordinator.send(1, 42, &config("key"), vec![], first.handler()).unwrap();
        coordinator.send(1, 42, &config("key"), vec![], second.handler()).unwrap();

        let posted: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(posted.len(), 2, "{:?}", posted);
        assert!(posted
            .iter()
            .all(|message| matches!(message, ClientMessage::SendMessage { message_id: 42, .. })));

        coordinator.handle_event(chunk(42, "fresh"));
        coordinator.handle_event(done(42));

        assert_eq!(first.calls().len(), 1);
        assert!(matches!(&first.calls()[0], Call::Error(f) if f.code == Some(ErrorCode::Cancelled)));
        assert_eq!(second.calls()[0], Call::Chunk("fresh".into(), "fresh".into()));
        assert!(matches!(second.calls()[1], Call::Done(_)));
    }

    #[test]
    fn send_without_channel_fails_synchronously() {
        let (mut coordinator, rx) = coordinator();
        drop(rx);
        let recorder = Recorder::default();

        let result = coordinator.send(1, 3, &config("key"), vec![], recorder.handler());

        assert!(matches!(result, Err(ClientError::ChannelUnavailable)));
        assert!(!coordinator.is_streaming());
        assert!(matches!(&recorder.calls()[0], Call::Error(f) if f.code == Some(ErrorCode::ChannelUnavailable)));
    }

    #[test]
    fn test_results_are_matched_by_request_id() {
        let (mut coordinator, mut rx) = coordinator();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();

        let request_id = coordinator.test_connection(&config("key"), move |result| sink.lock().unwrap().push(result));
        assert!(request_id.starts_with("test-"));
        assert_eq!(coordinator.pending_requests(), 1);
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::TestConnection { request_id: ref id, .. } if *id == request_id));

        let answer = TestResult {
            request_id: request_id.clone(),
            success: true,
            message: "Connection succeeded".into(),
            response_time_ms: Some(12),
            error: None,
        };
        coordinator.handle_event(ServerMessage::TestResult(TestResult {
            request_id: "test-someone-else".into(),
            ..answer.clone()
        }));
        coordinator.handle_event(ServerMessage::TestResult(answer.clone()));
        coordinator.handle_event(ServerMessage::TestResult(answer.clone()));

        assert_eq!(*results.lock().unwrap(), vec![answer]);
        assert_eq!(coordinator.pending_requests(), 0);
    }

    #[test]
    fn channel_lost_fails_everything_in_flight() {
        let (mut coordinator, _rx) = coordinator();
        let recorder = Recorder::default();
        let tests = Arc::new(Mutex::new(Vec::new()));
        let visions = Arc::new(Mutex::new(Vec::new()));

        coordinator.send(1, 5, &config("key"), vec![], recorder.handler()).unwrap();
        let sink = tests.clone();
        coordinator.test_connection(&config("key"), move |r| sink.lock().unwrap().push(r));
        let sink = visions.clone();
        coordinator.analyze_image(&config("key"), "data:,".into(), String::new(), move |r| {
            sink.lock().unwrap().push(r)
        });
        assert_eq!(coordinator.pending_requests(), 2);

        coordinator.channel_lost();

        assert!(matches!(&recorder.calls()[0], Call::Error(f) if f.code == Some(ErrorCode::ChannelUnavailable)));
        assert_eq!(tests.lock().unwrap()[0].error, Some(ErrorCode::ChannelUnavailable));
        assert_eq!(visions.lock().unwrap()[0].code, Some(ErrorCode::ChannelUnavailable));
        assert_eq!(coordinator.pending_requests(), 0);
        assert!(!coordinator.is_streaming());
    }

    #[test]
    fn test_without_channel_resolves_immediately() {
        let (mut coordinator, rx) = coordinator();
        drop(rx);
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();

        coordinator.test_connection(&config("key"), move |r| sink.lock().unwrap().push(r));

        let results = results.lock().unwrap();
        assert!(!results[0].success);
        assert_eq!(results[0].error, Some(ErrorCode::ChannelUnavailable));
        assert_eq!(coordinator.pending_requests(), 0);
    }
}
