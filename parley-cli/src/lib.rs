pub mod client;
pub mod config;
pub mod conversation;
pub mod conversation_logger;
pub mod coordinator;
pub mod image;
