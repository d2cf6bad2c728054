//! Seams between the core and the chat platform.
//!
//! `MessageSource` is what the poller reads from and `MessageSink` is what the
//! notification sink writes to. Discord's REST API implements both in
//! `interfaces::discord`; tests use in-memory fakes.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::core::channels::{ChannelId, MessageId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The server asked us to wait this long before the next request.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    /// Timeouts, connection failures and 5xx responses.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Anything else the server refused (4xx other than 429, bad payloads).
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Most recent messages of a channel, newest first, at most `limit`.
    async fn list_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, TransportError>;
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<MessageId, TransportError>;

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), TransportError>;
}
