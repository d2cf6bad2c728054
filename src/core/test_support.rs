//! In-memory collaborators shared by the unit tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::channels::{ChannelDirectory, ChannelId, MessageId, MonitoredChannel};
use crate::core::notify::{NotificationSink, RetryPolicy};
use crate::core::report::{
    CoverageSummary, GenerationOutput, GenerationRequest, ReportGenerator, ReportSystem,
};
use crate::core::transport::{InboundMessage, MessageSink, MessageSource, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedMessage {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub content: String,
}

/// Fake chat platform: scripted reads per channel, recorded writes.
#[derive(Default)]
pub struct FakeChat {
    listings: Mutex<HashMap<ChannelId, VecDeque<Result<Vec<InboundMessage>, TransportError>>>>,
    send_failures: Mutex<VecDeque<TransportError>>,
    edit_failures: Mutex<VecDeque<TransportError>>,
    send_delay: std::sync::Mutex<Duration>,
    pub sent: Mutex<Vec<SentMessage>>,
    pub edited: Mutex<Vec<EditedMessage>>,
    pub list_calls: AtomicUsize,
    pub send_attempts: AtomicUsize,
    next_id: AtomicU64,
}

impl FakeChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(10_000),
            ..Default::default()
        })
    }

    /// Queue the next listing for `channel`. An empty script returns `Ok(vec![])`.
    pub async fn push_listing(
        &self,
        channel: &ChannelId,
        listing: Result<Vec<InboundMessage>, TransportError>,
    ) {
        self.listings
            .lock()
            .await
            .entry(channel.clone())
            .or_default()
            .push_back(listing);
    }

    pub async fn fail_next_sends(&self, errors: Vec<TransportError>) {
        self.send_failures.lock().await.extend(errors);
    }

    pub async fn fail_next_edits(&self, errors: Vec<TransportError>) {
        self.edit_failures.lock().await.extend(errors);
    }

    /// Every later send waits `delay` before it is delivered.
    pub fn delay_sends(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub async fn sent_to(&self, channel: &ChannelId) -> Vec<String> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|m| &m.channel_id == channel)
            .map(|m| m.content.clone())
            .collect()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    /// Wait until at least `n` messages were delivered or `within` elapses.
    pub async fn wait_for_sent(&self, n: usize, within: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let count = self.sent_count().await;
            if count >= n || tokio::time::Instant::now() >= deadline {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MessageSource for FakeChat {
    async fn list_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .listings
            .lock()
            .await
            .get_mut(channel_id)
            .and_then(|q| q.pop_front());
        match next {
            Some(Ok(mut messages)) => {
                messages.truncate(limit);
                Ok(messages)
            }
            Some(Err(e)) => Err(e),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl MessageSink for FakeChat {
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<MessageId, TransportError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.send_failures.lock().await.pop_front() {
            return Err(err);
        }
        let message_id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().await.push(SentMessage {
            channel_id: channel_id.clone(),
            message_id,
            content: content.to_string(),
        });
        Ok(message_id)
    }

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.edit_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.edited.lock().await.push(EditedMessage {
            channel_id: channel_id.clone(),
            message_id,
            content: content.to_string(),
        });
        Ok(())
    }
}

pub fn quick_sink(chat: Arc<FakeChat>) -> NotificationSink {
    NotificationSink::new(
        chat,
        RetryPolicy {
            retry_ceiling: 2,
            base_backoff: Duration::from_millis(1),
            pacing: Duration::ZERO,
        },
    )
}

pub fn message(channel: &ChannelId, id: u64, author: &str, content: &str) -> InboundMessage {
    InboundMessage {
        id: MessageId(id),
        channel_id: channel.clone(),
        author_id: format!("u-{}", author),
        author_name: author.to_string(),
        content: content.to_string(),
        timestamp: String::new(),
        is_bot: false,
    }
}

pub fn monitored(id: &str, project_id: &str, name: &str) -> MonitoredChannel {
    MonitoredChannel {
        channel_id: ChannelId::new(id),
        project_id: project_id.to_string(),
        project_name: name.to_string(),
        active: true,
    }
}

pub struct StaticDirectory(pub Vec<MonitoredChannel>);

#[async_trait]
impl ChannelDirectory for StaticDirectory {
    async fn list_monitored_channels(&self) -> Result<Vec<MonitoredChannel>> {
        Ok(self.0.clone())
    }
}

#[derive(Clone)]
pub enum Behavior {
    Succeed(Vec<String>),
    Fail { exit: i32, stderr: String },
    Error(String),
    /// Never finishes on its own; only cancellation ends it.
    Hang,
    /// Finishes with the given links once the gate hands out a permit.
    Gated(Arc<Semaphore>, Vec<String>),
    Sleep(Duration, Vec<String>),
}

/// Report generator whose outcome is scripted per project id.
pub struct ScriptedGenerator {
    behaviors: std::sync::Mutex<HashMap<String, Behavior>>,
    default: Behavior,
    pub calls: Mutex<Vec<GenerationRequest>>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: AtomicUsize,
}

/// Counts a generation as in flight until its future completes or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedGenerator {
    pub fn new(default: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behaviors: std::sync::Mutex::new(HashMap::new()),
            default,
            calls: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, project_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(project_id.to_string(), behavior);
    }

    pub async fn call_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|r| r.project_id.clone())
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, project_id: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(project_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

fn success(links: Vec<String>) -> GenerationOutput {
    GenerationOutput {
        exit_code: Some(0),
        stdout: links.join("\n"),
        stderr: String::new(),
        artifact_links: links,
    }
}

#[async_trait]
impl ReportGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationOutput> {
        self.calls.lock().await.push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        let behavior = self.behavior_for(&request.project_id);
        let work = async {
            match behavior {
                Behavior::Succeed(links) => Ok::<_, anyhow::Error>(success(links)),
                Behavior::Fail { exit, stderr } => Ok(GenerationOutput {
                    exit_code: Some(exit),
                    stdout: String::new(),
                    stderr,
                    artifact_links: Vec::new(),
                }),
                Behavior::Error(msg) => Err(anyhow::anyhow!(msg)),
                Behavior::Hang => std::future::pending().await,
                Behavior::Gated(gate, links) => {
                    gate.acquire().await?.forget();
                    Ok(success(links))
                }
                Behavior::Sleep(d, links) => {
                    tokio::time::sleep(d).await;
                    Ok(success(links))
                }
            }
        };
        tokio::select! {
            r = work => r,
            _ = cancel.cancelled() => Err(anyhow::anyhow!("generation cancelled")),
        }
    }
}

#[derive(Default)]
pub struct FakeReportSystem {
    pub coverage: std::sync::Mutex<Option<CoverageSummary>>,
    pub notify_result: std::sync::Mutex<Option<bool>>,
    pub notified: Mutex<Vec<(String, ChannelId)>>,
}

#[async_trait]
impl ReportSystem for FakeReportSystem {
    async fn coverage(&self) -> Result<CoverageSummary> {
        self.coverage
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("coverage sheet unavailable"))
    }

    async fn notify_missing(&self, target: &ChannelId) -> Result<bool> {
        self.notified
            .lock()
            .await
            .push(("missing".to_string(), target.clone()));
        let result = *self.notify_result.lock().unwrap();
        result.ok_or_else(|| anyhow::anyhow!("broadcast failed"))
    }

    async fn notify_coordinators(&self, admin_channel: &ChannelId) -> Result<bool> {
        self.notified
            .lock()
            .await
            .push(("coordinators".to_string(), admin_channel.clone()));
        let result = *self.notify_result.lock().unwrap();
        result.ok_or_else(|| anyhow::anyhow!("broadcast failed"))
    }
}
