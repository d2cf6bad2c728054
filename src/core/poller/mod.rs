//! Per-channel message polling.
//!
//! Every monitored channel gets its own task with its own cadence, so one
//! failing channel never slows the others. New messages are forwarded in
//! ascending id order over an mpsc channel; the dispatcher consumes them.

use anyhow::Result;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::channels::{ChannelId, ChannelRegistry, MessageId};
use crate::core::config::PollingConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::transport::{InboundMessage, MessageSource, TransportError};

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub relax_factor: f64,
    pub batch_size: usize,
}

impl PollSettings {
    pub fn from_config(cfg: &PollingConfig) -> Self {
        Self {
            base_interval: cfg.base_interval(),
            max_interval: cfg.max_interval(),
            backoff_multiplier: cfg.backoff_multiplier,
            relax_factor: cfg.relax_factor,
            batch_size: cfg.batch_size,
        }
    }
}

/// Watermark and cadence of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    /// `None` until the first successful fetch.
    pub watermark: Option<MessageId>,
    pub interval: Duration,
    pub consecutive_errors: u32,
}

impl PollState {
    pub fn new(settings: &PollSettings) -> Self {
        Self {
            watermark: None,
            interval: settings.base_interval,
            consecutive_errors: 0,
        }
    }

    /// Filter a newest-first batch down to unseen messages, oldest first.
    ///
    /// The first batch only sets the watermark: history is never replayed.
    pub fn accept(&mut self, batch: Vec<InboundMessage>, own_id: Option<&str>) -> Vec<InboundMessage> {
        let highest = batch.iter().map(|m| m.id).max();
        let Some(watermark) = self.watermark else {
            self.watermark = Some(highest.unwrap_or(MessageId(0)));
            return Vec::new();
        };
        if let Some(highest) = highest {
            self.watermark = Some(watermark.max(highest));
        }
        let mut fresh: Vec<InboundMessage> = batch
            .into_iter()
            .filter(|m| m.id > watermark)
            .filter(|m| !m.is_bot && own_id != Some(m.author_id.as_str()))
            .collect();
        fresh.sort_by_key(|m| m.id);
        fresh
    }

    /// Successful poll: clear errors and step back toward the base interval.
    pub fn on_success(&mut self, settings: &PollSettings) -> Duration {
        self.consecutive_errors = 0;
        if self.interval > settings.base_interval {
            self.interval = self
                .interval
                .mul_f64(settings.relax_factor)
                .max(settings.base_interval);
        }
        self.interval
    }

    /// Failed poll. Returns how long to wait before the next attempt.
    pub fn on_error(&mut self, err: &TransportError, settings: &PollSettings) -> Duration {
        match err {
            TransportError::RateLimited(delay) => *delay,
            TransportError::Transient(_) | TransportError::Rejected(_) => {
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                // An overflowing product lands on the ceiling.
                let next = self.interval.as_secs_f64() * settings.backoff_multiplier;
                self.interval = Duration::try_from_secs_f64(next)
                    .map_or(settings.max_interval, |next| next.min(settings.max_interval));
                self.interval
            }
        }
    }
}

struct ChannelTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub uptime: Duration,
    pub channels: usize,
}

#[derive(Clone)]
pub struct ChannelPoller {
    source: Arc<dyn MessageSource>,
    registry: ChannelRegistry,
    settings: PollSettings,
    own_user_id: Option<String>,
    /// Polled even though the directory does not list them (the admin channel).
    extra_channels: Vec<ChannelId>,
    forward: mpsc::Sender<InboundMessage>,
    tasks: Arc<Mutex<HashMap<ChannelId, ChannelTask>>>,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl ChannelPoller {
    pub fn new(
        source: Arc<dyn MessageSource>,
        registry: ChannelRegistry,
        settings: PollSettings,
        own_user_id: Option<String>,
        forward: mpsc::Sender<InboundMessage>,
    ) -> Self {
        Self {
            source,
            registry,
            settings,
            own_user_id,
            extra_channels: Vec::new(),
            forward,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub fn with_extra_channel(mut self, channel_id: ChannelId) -> Self {
        if !channel_id.is_empty() && !self.extra_channels.contains(&channel_id) {
            self.extra_channels.push(channel_id);
        }
        self
    }

    /// One fetch for one channel; updates `state` and returns new messages.
    pub async fn poll(
        &self,
        channel_id: &ChannelId,
        state: &mut PollState,
    ) -> Result<Vec<InboundMessage>, TransportError> {
        let batch = self
            .source
            .list_messages(channel_id, self.settings.batch_size)
            .await?;
        let fetched = batch.len();
        let initial = state.watermark.is_none();
        let fresh = state.accept(batch, self.own_user_id.as_deref());
        if initial {
            debug!(
                "[poller] Channel {} initialized at {:?}",
                channel_id, state.watermark
            );
        } else if fetched > 0 && fresh.len() == fetched && fetched == self.settings.batch_size {
            warn!(
                "[poller] Channel {} returned a full batch of new messages; older ones may have been skipped",
                channel_id
            );
        }
        Ok(fresh)
    }

    /// Start tasks for newly active channels and stop tasks for channels that
    /// left the directory.
    pub async fn reconcile(&self) -> usize {
        let mut desired: HashMap<ChannelId, String> = self
            .registry
            .active_channels()
            .await
            .into_iter()
            .map(|c| (c.channel_id, c.project_name))
            .collect();
        for id in &self.extra_channels {
            desired
                .entry(id.clone())
                .or_insert_with(|| "administration".to_string());
        }
        let mut tasks = self.tasks.lock().await;

        tasks.retain(|id, task| {
            let keep = desired.contains_key(id) && !task.handle.is_finished();
            if !keep {
                task.cancel.cancel();
                info!("[poller] Stopped monitoring channel {}", id);
            }
            keep
        });
        for (id, label) in desired {
            if tasks.contains_key(&id) || self.shutdown.is_cancelled() {
                continue;
            }
            let cancel = self.shutdown.child_token();
            let poller = self.clone();
            let token = cancel.clone();
            info!("[poller] Monitoring {} (channel {})", label, id);
            let channel_id = id.clone();
            let handle = tokio::spawn(async move { poller.run_channel(channel_id, token).await });
            tasks.insert(id, ChannelTask { cancel, handle });
        }
        tasks.len()
    }

    /// Reload the directory and reconcile. A failed reload keeps the last
    /// snapshot, which still restarts channel tasks that died.
    pub async fn refresh_directory(&self) -> usize {
        // The registry logs its own failures.
        let _ = self.registry.refresh().await;
        self.reconcile().await
    }

    async fn run_channel(&self, channel_id: ChannelId, cancel: CancellationToken) {
        let mut state = PollState::new(&self.settings);
        let stagger_ms = self.settings.base_interval.as_millis().max(1) as u64;
        let mut wait = Duration::from_millis(rand::thread_rng().gen_range(0..stagger_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.poll(&channel_id, &mut state) => r,
            };
            wait = match result {
                Ok(messages) => {
                    for message in messages {
                        if self.forward.send(message).await.is_err() {
                            debug!("[poller] Dispatcher is gone, stopping channel {}", channel_id);
                            return;
                        }
                    }
                    state.on_success(&self.settings)
                }
                Err(err) => {
                    let next = state.on_error(&err, &self.settings);
                    match &err {
                        TransportError::RateLimited(_) => warn!(
                            "[poller] Channel {} rate limited, waiting {:?}",
                            channel_id, next
                        ),
                        _ => warn!(
                            "[poller] Channel {} poll failed (error #{}): {}. Next attempt in {:?}",
                            channel_id, state.consecutive_errors, err, next
                        ),
                    }
                    next
                }
            };
        }
        debug!("[poller] Channel {} task finished", channel_id);
    }

    pub async fn heartbeat(&self) -> Heartbeat {
        let beat = Heartbeat {
            uptime: self.started_at.elapsed(),
            channels: self.tasks.lock().await.len(),
        };
        let secs = beat.uptime.as_secs();
        info!(
            "[poller] Alive: uptime {:02}:{:02}:{:02}, monitoring {} channel(s)",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60,
            beat.channels
        );
        beat
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<ChannelTask> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in tasks {
            let _ = task.handle.await;
        }
        info!("[poller] All channel tasks stopped");
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ChannelPoller {
    async fn on_init(&mut self) -> Result<()> {
        if let Err(e) = self.registry.refresh().await {
            warn!("[poller] Initial directory load failed: {:#}", e);
        }
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let count = self.reconcile().await;
        info!("[poller] Polling {} channel(s)", count);
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}
