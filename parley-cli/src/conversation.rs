use crate::coordinator::{ClientError, Outbound, StreamCoordinator, StreamHandler};
use parley_shared::{ChatMessage, MessageId, ModelConfig};

/// Running history of the console conversation and its id counters.
pub struct Conversation {
    id: u64,
    next_message_id: MessageId,
    history: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: 1,
            next_message_id: 1,
            history: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Sends `text` with the history so far. The user turn joins the history
    /// only once the coordinator has accepted it.
    pub fn submit<O: Outbound>(
        &mut self,
        coordinator: &mut StreamCoordinator<O>,
        config: &ModelConfig,
        text: &str,
        handler: impl FnOnce(MessageId) -> Box<dyn StreamHandler>,
    ) -> Result<MessageId, ClientError> {
        let message_id = self.next_message_id;
        self.next_message_id += 1;

        let mut outgoing = self.history.clone();
        outgoing.push(ChatMessage::user(text));
        coordinator.send(self.id, message_id, config, outgoing, handler(message_id))?;

        self.history.push(ChatMessage::user(text));
        Ok(message_id)
    }

    pub fn record_reply(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    /// Starts over with an empty history under a new conversation id.
    pub fn clear(&mut self) {
        self.history.clear();
        self.id += 1;
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}
