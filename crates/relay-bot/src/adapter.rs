//! `NullAdapter`: a `ChatAdapter` that logs instead of speaking a real chat
//! wire protocol. Stands in for a Discord/Slack/etc. adapter until one is
//! wired in; every message crosses the same trait boundary either way.

use async_trait::async_trait;
use relay_core::chat::{Attachment, ChannelRef, ChatAdapter, InboundMessage};
use relay_core::progress::EditablePendingMessage;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct NullMessage {
    channel_id: String,
    text: Mutex<String>,
}

#[async_trait]
impl EditablePendingMessage for NullMessage {
    async fn edit(&self, text: &str) -> Result<(), String> {
        *self.text.lock().unwrap() = text.to_string();
        info!(channel_id = %self.channel_id, text, "chat message edited");
        Ok(())
    }
}

pub struct NullAdapter {
    bot_user_id: String,
}

impl NullAdapter {
    pub fn new(bot_user_id: impl Into<String>) -> Self {
        NullAdapter { bot_user_id: bot_user_id.into() }
    }
}

#[async_trait]
impl ChatAdapter for NullAdapter {
    async fn send(&self, channel: &ChannelRef, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String> {
        info!(channel_id = %channel.channel_id, text, "chat message sent");
        Ok(Arc::new(NullMessage { channel_id: channel.channel_id.clone(), text: Mutex::new(text.to_string()) }))
    }

    async fn reply(&self, msg: &InboundMessage, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String> {
        self.send(&msg.channel, text).await
    }

    async fn fetch_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, String> {
        Err(format!("NullAdapter cannot fetch attachment {}", attachment.name))
    }

    fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_returns_an_editable_handle() {
        let adapter = NullAdapter::new("bot-1");
        let channel = ChannelRef { guild_id: None, channel_id: "c1".to_string(), is_thread: false };
        let handle = adapter.send(&channel, "hello").await.unwrap();
        handle.edit("updated").await.unwrap();
        assert_eq!(adapter.bot_user_id(), "bot-1");
    }
}
