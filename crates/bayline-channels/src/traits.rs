//! Outbound chat interface.
//!
//! The chat gateway (Telegram/WhatsApp transport, message splitting, the
//! LLM loop) lives outside this process. The dispatcher only needs a way to
//! push text back to a chat.

use async_trait::async_trait;

/// A message arriving from the gateway, already attributed to a chat.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: String,
    pub sender: String,
    pub content: String,
}

#[async_trait]
pub trait ChatOutbound: Send + Sync {
    fn name(&self) -> &str;

    /// Pushes one text message to the chat. Errors are the gateway's
    /// problem; the dispatcher logs and moves on.
    async fn send(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;
}

/// Drops everything; used when no gateway callback is configured.
pub struct NullOutbound;

#[async_trait]
impl ChatOutbound for NullOutbound {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, _chat_id: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
