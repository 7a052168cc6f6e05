//! The channel-adapter seam.
//!
//! A provider is an external front-end (chat platform, rich TUI, …)
//! registered with the communication registry. Providers declare which
//! message types they care about; the registry filters broadcasts
//! accordingly. Chat-oriented providers typically accept a subset; rich
//! TUIs accept everything.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Lifecycle,
    Chat,
    Question,
    Result,
    Warning,
    Error,
    ToolUse,
    Thinking,
}

/// One outbound message to a channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub channel_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl ChannelMessage {
    pub fn new(channel_id: impl Into<String>, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_type,
            content: content.into(),
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A message arriving from a channel, handed to the harness for routing.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub content: String,
    /// Conversation key grouping messages onto one task.
    pub correlation_key: Option<String>,
    pub project: Option<String>,
    pub role: Option<String>,
    pub task_slug: Option<String>,
}

pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the provider can currently deliver messages.
    fn is_ready(&self) -> bool;

    /// Message types this provider wants. `None` = everything.
    fn accepted_types(&self) -> Option<&HashSet<MessageType>> {
        None
    }

    async fn start(&self) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn send(&self, message: &ChannelMessage) -> anyhow::Result<()>;

    /// Update a channel's presence indicator (e.g. typing/working).
    async fn set_status(&self, channel_id: &str, status: &str) -> anyhow::Result<()>;

    /// Install the inbound handler. Providers that never produce inbound
    /// traffic may ignore it.
    fn on_inbound(&self, handler: InboundHandler);
}
