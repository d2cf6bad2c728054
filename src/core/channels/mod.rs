//! Monitored channels and the directory they are read from.
//!
//! The directory is an external collaborator (a spreadsheet in production,
//! a TOML file or the static `[[channels]]` table here). The registry keeps
//! the last good snapshot so a failed refresh never empties the channel set.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Discord channel identifier. Only the digits of the configured value are kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(raw: &str) -> Self {
        Self(raw.chars().filter(|c| c.is_ascii_digit()).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Discord mention markup for this channel.
    pub fn mention(&self) -> String {
        format!("<#{}>", self.0)
    }
}

impl From<String> for ChannelId {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<&str> for ChannelId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discord message snowflake. Snowflakes grow with time, so numeric order is
/// creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredChannel {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub project_id: String,
    pub project_name: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Source of the channel/project bindings.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    async fn list_monitored_channels(&self) -> Result<Vec<MonitoredChannel>>;
}

#[derive(Debug, Deserialize)]
struct ChannelsFile {
    #[serde(default)]
    channels: Vec<MonitoredChannel>,
}

/// Directory backed by the static `[[channels]]` table plus an optional TOML
/// file that is re-read on every refresh. File entries win over static ones
/// with the same channel id.
pub struct ConfiguredDirectory {
    entries: Vec<MonitoredChannel>,
    file: Option<PathBuf>,
}

impl ConfiguredDirectory {
    pub fn new(entries: Vec<MonitoredChannel>, file: Option<PathBuf>) -> Self {
        Self { entries, file }
    }
}

#[async_trait]
impl ChannelDirectory for ConfiguredDirectory {
    async fn list_monitored_channels(&self) -> Result<Vec<MonitoredChannel>> {
        let mut merged: Vec<MonitoredChannel> = self.entries.clone();
        if let Some(path) = &self.file {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading channels file {}", path.display()))?;
            let parsed: ChannelsFile = toml::from_str(&raw)
                .with_context(|| format!("parsing channels file {}", path.display()))?;
            for entry in parsed.channels {
                merged.retain(|c| c.channel_id != entry.channel_id);
                merged.push(entry);
            }
        }
        merged.retain(|c| !c.channel_id.is_empty());
        Ok(merged)
    }
}

/// Last known snapshot of the channel directory.
#[derive(Clone)]
pub struct ChannelRegistry {
    directory: Arc<dyn ChannelDirectory>,
    snapshot: Arc<RwLock<HashMap<ChannelId, MonitoredChannel>>>,
}

impl ChannelRegistry {
    pub fn new(directory: Arc<dyn ChannelDirectory>) -> Self {
        Self {
            directory,
            snapshot: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Re-read the directory. On failure the previous snapshot is kept.
    pub async fn refresh(&self) -> Result<usize> {
        match self.directory.list_monitored_channels().await {
            Ok(channels) => {
                let count = channels.len();
                let map = channels
                    .into_iter()
                    .map(|c| (c.channel_id.clone(), c))
                    .collect::<HashMap<_, _>>();
                *self.snapshot.write().await = map;
                info!("[directory] Loaded {} channel(s)", count);
                Ok(count)
            }
            Err(e) => {
                warn!("[directory] Refresh failed, keeping previous snapshot: {:#}", e);
                Err(e)
            }
        }
    }

    pub async fn get(&self, channel_id: &ChannelId) -> Option<MonitoredChannel> {
        self.snapshot.read().await.get(channel_id).cloned()
    }

    /// Active channels ordered by project name.
    pub async fn active_channels(&self) -> Vec<MonitoredChannel> {
        let mut out: Vec<MonitoredChannel> = self
            .snapshot
            .read()
            .await
            .values()
            .filter(|c| c.active)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.project_name
                .to_lowercase()
                .cmp(&b.project_name.to_lowercase())
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        out
    }

    pub async fn project_name(&self, channel_id: &ChannelId) -> String {
        self.get(channel_id)
            .await
            .map(|c| c.project_name)
            .unwrap_or_else(|| format!("channel {}", channel_id))
    }
}

#[cfg(test)]
mod tests;
