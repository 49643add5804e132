//! Chat-platform adapter contract. The wire protocol itself is out of
//! scope for this crate; this module defines only the trait boundary the
//! core depends on, so `relay-bot` (or a future real adapter) can plug in
//! a concrete implementation.

use crate::progress::EditablePendingMessage;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ChannelRef {
    pub guild_id: Option<String>,
    pub channel_id: String,
    pub is_thread: bool,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub content: String,
    pub author_id: String,
    pub author_is_bot: bool,
    pub channel: ChannelRef,
    pub attachments: Vec<Attachment>,
    pub bot_mentioned: bool,
    pub is_dm: bool,
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn send(&self, channel: &ChannelRef, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String>;
    async fn reply(&self, msg: &InboundMessage, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String>;
    async fn fetch_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, String>;
    fn bot_user_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingMessage(Mutex<String>);

    #[async_trait]
    impl EditablePendingMessage for RecordingMessage {
        async fn edit(&self, text: &str) -> Result<(), String> {
            *self.0.lock().unwrap() = text.to_string();
            Ok(())
        }
    }

    struct TestAdapter;

    #[async_trait]
    impl ChatAdapter for TestAdapter {
        async fn send(&self, _channel: &ChannelRef, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String> {
            Ok(Arc::new(RecordingMessage(Mutex::new(text.to_string()))))
        }
        async fn reply(&self, _msg: &InboundMessage, text: &str) -> Result<Arc<dyn EditablePendingMessage>, String> {
            Ok(Arc::new(RecordingMessage(Mutex::new(text.to_string()))))
        }
        async fn fetch_attachment(&self, _attachment: &Attachment) -> Result<Vec<u8>, String> {
            Ok(Vec::new())
        }
        fn bot_user_id(&self) -> &str {
            "bot-1"
        }
    }

    #[tokio::test]
    async fn test_adapter_satisfies_trait_object_safety() {
        let adapter: Arc<dyn ChatAdapter> = Arc::new(TestAdapter);
        let channel = ChannelRef { guild_id: None, channel_id: "c1".to_string(), is_thread: false };
        let handle = adapter.send(&channel, "hi").await.unwrap();
        handle.edit("bye").await.unwrap();
        assert_eq!(adapter.bot_user_id(), "bot-1");
    }
}
