//! Outgoing channel messages with retry.
//!
//! A rate-limit response is honoured once (sleep exactly the server delay and
//! try again); server-side failures are retried with exponential backoff up to
//! the configured ceiling. When delivery finally fails the error is logged and
//! returned, and callers carry on: an undelivered notice never fails a job.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::core::channels::{ChannelId, MessageId};
use crate::core::config::NotificationConfig;
use crate::core::transport::{MessageSink, TransportError};

/// Discord rejects message content longer than this.
pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("delivery to channel {channel} failed after {attempts} attempt(s): {last}")]
    Exhausted {
        channel: ChannelId,
        attempts: u32,
        last: TransportError,
    },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_ceiling: u32,
    pub base_backoff: Duration,
    pub pacing: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &NotificationConfig) -> Self {
        Self {
            retry_ceiling: cfg.retry_ceiling,
            base_backoff: Duration::from_millis(cfg.base_backoff_ms),
            pacing: Duration::from_millis(cfg.pacing_ms),
        }
    }

    /// Delay before retry number `retry` (1-based) after a server error.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// What the retry loop should do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Next {
    Wait(Duration),
    GiveUp,
}

#[derive(Debug, Default)]
struct RetryState {
    server_retries: u32,
    rate_limit_retried: bool,
}

impl RetryState {
    fn after(&mut self, err: &TransportError, policy: &RetryPolicy) -> Next {
        match err {
            TransportError::RateLimited(delay) if !self.rate_limit_retried => {
                self.rate_limit_retried = true;
                Next::Wait(*delay)
            }
            TransportError::RateLimited(_) => Next::GiveUp,
            TransportError::Transient(_) if self.server_retries < policy.retry_ceiling => {
                self.server_retries += 1;
                Next::Wait(policy.backoff(self.server_retries))
            }
            TransportError::Transient(_) | TransportError::Rejected(_) => Next::GiveUp,
        }
    }
}

pub fn truncate_for_channel(content: &str) -> String {
    if content.chars().count() <= MAX_MESSAGE_CHARS {
        return content.to_string();
    }
    let mut out: String = content.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    out.push('…');
    out
}

#[derive(Clone)]
pub struct NotificationSink {
    transport: Arc<dyn MessageSink>,
    policy: RetryPolicy,
    last_sent: Arc<Mutex<Option<Instant>>>,
}

impl NotificationSink {
    pub fn new(transport: Arc<dyn MessageSink>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            last_sent: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn send(&self, channel_id: &ChannelId, content: &str) -> Result<MessageId, NotifyError> {
        let content = truncate_for_channel(content);
        let mut state = RetryState::default();
        let mut attempts = 0;
        loop {
            self.pace().await;
            attempts += 1;
            match self.transport.send_message(channel_id, &content).await {
                Ok(id) => {
                    debug!("[notify] Sent message {} to channel {}", id, channel_id);
                    return Ok(id);
                }
                Err(e) => self.handle_failure(channel_id, attempts, e, &mut state).await?,
            }
        }
    }

    pub async fn update(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), NotifyError> {
        let content = truncate_for_channel(content);
        let mut state = RetryState::default();
        let mut attempts = 0;
        loop {
            self.pace().await;
            attempts += 1;
            match self
                .transport
                .edit_message(channel_id, message_id, &content)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => self.handle_failure(channel_id, attempts, e, &mut state).await?,
            }
        }
    }

    /// Sleeps before the next attempt, or returns the final error.
    async fn handle_failure(
        &self,
        channel_id: &ChannelId,
        attempts: u32,
        err: TransportError,
        state: &mut RetryState,
    ) -> Result<(), NotifyError> {
        match state.after(&err, &self.policy) {
            Next::Wait(delay) => {
                warn!(
                    "[notify] Delivery to channel {} failed (attempt {}): {}. Retrying in {:?}",
                    channel_id, attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Next::GiveUp => {
                error!(
                    "[notify] Giving up on channel {} after {} attempt(s): {}",
                    channel_id, attempts, err
                );
                Err(NotifyError::Exhausted {
                    channel: channel_id.clone(),
                    attempts,
                    last: err,
                })
            }
        }
    }

    /// Keeps at least `pacing` between two outgoing requests.
    async fn pace(&self) {
        if self.policy.pacing.is_zero() {
            return;
        }
        let mut last = self.last_sent.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.policy.pacing;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}
