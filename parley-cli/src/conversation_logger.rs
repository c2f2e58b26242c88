use anyhow::Result;
use chrono::{DateTime, Local};
use parley_shared::{ChatMessage, ErrorCode, MessageId, MessageRole};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Local>,
    pub entry_type: EntryType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EntryType {
    UserMessage {
        message_id: MessageId,
        content: String,
    },
    AssistantMessage {
        message_id: MessageId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    SystemMessage {
        content: String,
    },
    StreamFailed {
        message_id: MessageId,
        code: Option<ErrorCode>,
        error: String,
    },
}

/// Append-only JSONL log of one console session.
pub struct ConversationLogger {
    current_log_file: Option<PathBuf>,
}

impl ConversationLogger {
    pub fn new(log_dir: &Path) -> Result<Self> {
        if !log_dir.exists() {
            fs::create_dir_all(log_dir)?;
        }

        let session_start = Local::now();
        let filename = format!("conversation_{}.jsonl", session_start.format("%Y%m%d_%H%M%S"));
        let log_file = log_dir.join(filename);

        debug!("Starting conversation logger: {:?}", log_file);

        Ok(Self {
            current_log_file: Some(log_file),
        })
    }

    /// A logger that writes nothing, for when the log directory is unusable.
    pub fn disabled() -> Self {
        Self { current_log_file: None }
    }

    pub fn log_entry(&self, entry_type: EntryType) -> Result<()> {
        if let Some(ref log_file) = self.current_log_file {
            let entry = ConversationEntry {
                timestamp: Local::now(),
                entry_type,
            };

            let json = serde_json::to_string(&entry)?;

            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;

            writeln!(file, "{}", json)?;
            file.flush()?;
        }
        Ok(())
    }

    pub fn log_message(&self, message_id: MessageId, message: &ChatMessage, finish_reason: Option<String>) {
        let entry_type = match message.role {
            MessageRole::User => EntryType::UserMessage {
                message_id,
                content: message.content.clone(),
            },
            MessageRole::Assistant => EntryType::AssistantMessage {
                message_id,
                content: message.content.clone(),
                finish_reason,
            },
            MessageRole::System => EntryType::SystemMessage {
                content: message.content.clone(),
            },
        };
        if let Err(e) = self.log_entry(entry_type) {
            error!("Failed to log message: {}", e);
        }
    }

    pub fn log_failure(&self, message_id: MessageId, code: Option<ErrorCode>, error: &str) {
        let entry = EntryType::StreamFailed {
            message_id,
            code,
            error: error.to_string(),
        };
        if let Err(e) = self.log_entry(entry) {
            error!("Failed to log stream failure: {}", e);
        }
    }

    pub fn get_current_log_path(&self) -> Option<&Path> {
        self.current_log_file.as_deref()
    }
}
