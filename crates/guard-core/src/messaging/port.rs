use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef, UserId},
    Result,
};

/// Hexagonal port over the chat platform.
///
/// Telegram is the only implementation; tests use in-memory fakes.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    /// Remove a message. Callers treat failures as non-fatal.
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    /// Send an already-chunked plain-text message.
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<()>;

    /// Whether `user_id` is an administrator (or the creator) of `chat_id`.
    async fn is_administrator(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;
}
