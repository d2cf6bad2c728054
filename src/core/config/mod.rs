//! Service configuration.
//!
//! Built once at startup from a TOML file plus a handful of environment
//! overrides, validated, and then handed to each component's constructor.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::channels::{ChannelId, MonitoredChannel};

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Upper bound for every configured duration (one week).
pub const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} could not be read: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discord: DiscordConfig,
    pub commands: CommandConfig,
    pub polling: PollingConfig,
    pub queue: QueueConfig,
    pub notifications: NotificationConfig,
    pub generator: GeneratorConfig,
    pub report_system: Option<ReportSystemConfig>,
    pub logging: LoggingConfig,
    pub channels: Vec<MonitoredChannel>,
    pub channels_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: String,
    pub api_base: String,
    /// The bot's own user id. Messages authored by it are never treated as commands.
    pub bot_user_id: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            bot_user_id: None,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub prefix: String,
    pub admin_channel_id: Option<ChannelId>,
    pub notification_channel_id: Option<ChannelId>,
    /// Sender ids or usernames allowed to issue commands. Empty means everyone.
    pub authorized_senders: Vec<String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            prefix: "!".to_string(),
            admin_channel_id: None,
            notification_channel_id: None,
            authorized_senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub base_interval_secs: f64,
    pub max_interval_secs: f64,
    pub backoff_multiplier: f64,
    pub relax_factor: f64,
    pub batch_size: usize,
    pub heartbeat_secs: u64,
    pub directory_refresh_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: 5.0,
            max_interval_secs: 300.0,
            backoff_multiplier: 2.0,
            relax_factor: 0.8,
            batch_size: 10,
            heartbeat_secs: 30,
            directory_refresh_secs: 300,
        }
    }
}

impl PollingConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs_f64(self.base_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs_f64(self.max_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FailurePattern {
    pub pattern: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub job_timeout_secs: f64,
    pub history_limit: usize,
    /// Checked before the built-in failure patterns, in order.
    pub failure_patterns: Vec<FailurePattern>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            job_timeout_secs: 900.0,
            history_limit: 50,
            failure_patterns: Vec::new(),
        }
    }
}

impl QueueConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub retry_ceiling: u32,
    pub base_backoff_ms: u64,
    pub pacing_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            base_backoff_ms: 1000,
            pacing_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub program: String,
    /// `{channel}` and `{project}` are substituted per job.
    pub args: Vec<String>,
    pub omit_dashboard_flag: String,
    pub working_dir: Option<PathBuf>,
    pub link_pattern: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: String::new(),
            args: vec![
                "run.py".to_string(),
                "--channel".to_string(),
                "{channel}".to_string(),
                "--quiet".to_string(),
            ],
            omit_dashboard_flag: "--hide-dashboard".to_string(),
            working_dir: None,
            link_pattern: r"https?://\S+".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReportSystemConfig {
    pub program: String,
    /// Prepended to each subcommand (`coverage`, `notify-missing`, `notify-coordinators`).
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_toml_str(&raw, path)?;
        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment overrides, applied on top of the parsed file.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("DISCORD_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.discord.token = token.trim().to_string();
        }
        if let Some(admin) = lookup("DISCORD_ADMIN_CHANNEL_ID") {
            let id = ChannelId::new(&admin);
            if !id.is_empty() {
                self.commands.admin_channel_id = Some(id);
            }
        }
        if let Some(notify) = lookup("DISCORD_NOTIFICATION_CHANNEL_ID") {
            let id = ChannelId::new(&notify);
            if !id.is_empty() {
                self.commands.notification_channel_id = Some(id);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discord.token.trim().is_empty() {
            return Err(ConfigError::Missing("discord.token"));
        }
        if url::Url::parse(&self.discord.api_base).is_err() {
            return Err(ConfigError::Invalid {
                field: "discord.api_base",
                reason: format!("`{}` is not a URL", self.discord.api_base),
            });
        }
        match &self.commands.admin_channel_id {
            Some(id) if !id.is_empty() => {}
            _ => return Err(ConfigError::Missing("commands.admin_channel_id")),
        }
        if self.commands.prefix.trim().is_empty() {
            return Err(ConfigError::Missing("commands.prefix"));
        }
        if self.generator.program.trim().is_empty() {
            return Err(ConfigError::Missing("generator.program"));
        }
        if regex::Regex::new(&self.generator.link_pattern).is_err() {
            return Err(ConfigError::Invalid {
                field: "generator.link_pattern",
                reason: "not a valid regular expression".to_string(),
            });
        }
        for fp in &self.queue.failure_patterns {
            if regex::Regex::new(&fp.pattern).is_err() {
                return Err(ConfigError::Invalid {
                    field: "queue.failure_patterns",
                    reason: format!("`{}` is not a valid regular expression", fp.pattern),
                });
            }
        }
        if self.queue.worker_count == 0 {
            return Err(ConfigError::Invalid {
                field: "queue.worker_count",
                reason: "must be at least 1".to_string(),
            });
        }
        check_seconds("queue.job_timeout_secs", self.queue.job_timeout_secs)?;
        let p = &self.polling;
        check_seconds("polling.base_interval_secs", p.base_interval_secs)?;
        check_seconds("polling.max_interval_secs", p.max_interval_secs)?;
        if p.max_interval_secs < p.base_interval_secs {
            return Err(ConfigError::Invalid {
                field: "polling.max_interval_secs",
                reason: "must not be below the base interval".to_string(),
            });
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&p.backoff_multiplier) {
            return Err(ConfigError::Invalid {
                field: "polling.backoff_multiplier",
                reason: format!("must be between 1.0 and {}", MAX_BACKOFF_MULTIPLIER),
            });
        }
        if !(p.relax_factor > 0.0 && p.relax_factor < 1.0) {
            return Err(ConfigError::Invalid {
                field: "polling.relax_factor",
                reason: "must be between 0 and 1 (exclusive)".to_string(),
            });
        }
        if p.batch_size == 0 || p.batch_size > 100 {
            return Err(ConfigError::Invalid {
                field: "polling.batch_size",
                reason: "must be between 1 and 100".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for ch in &self.channels {
            if ch.channel_id.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "channels",
                    reason: format!("entry `{}` has no channel id", ch.project_name),
                });
            }
            if !seen.insert(ch.channel_id.clone()) {
                return Err(ConfigError::Invalid {
                    field: "channels",
                    reason: format!("channel {} is listed twice", ch.channel_id),
                });
            }
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reportbot")
            .join("config.toml")
    }
}

/// Positive, finite and at most [`MAX_DURATION_SECS`].
fn check_seconds(field: &'static str, secs: f64) -> Result<(), ConfigError> {
    if secs > 0.0 && secs <= MAX_DURATION_SECS {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("must be a number of seconds between 0 and {}", MAX_DURATION_SECS),
        })
    }
}
