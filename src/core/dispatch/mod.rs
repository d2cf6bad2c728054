//! Command recognition and routing.
//!
//! A command is the prefix, one verb and at most one flag token. Anything
//! else is ordinary chat and is ignored. Administrative verbs only run in
//! the configured administration channel.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::channels::{ChannelId, ChannelRegistry};
use crate::core::config::CommandConfig;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::messages;
use crate::core::notify::NotificationSink;
use crate::core::queue::{EnqueueResult, JobQueue};
use crate::core::report::{JobArgs, ReportSystem};
use crate::core::transport::InboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Report,
    QueueStatus,
    Coverage,
    NotifyMissing,
    NotifyCoordinators,
    Channels,
    Topic,
    Help,
}

impl Verb {
    pub fn from_word(word: &str) -> Option<Self> {
        let verb = match word {
            "relatorio" | "relatório" | "report" => Verb::Report,
            "status" | "fila" | "queue" => Verb::QueueStatus,
            "controle" | "coverage" => Verb::Coverage,
            "notificar" | "notify" => Verb::NotifyMissing,
            "notificar_coordenadores" | "notify-coordinators" => Verb::NotifyCoordinators,
            "canais" | "channels" => Verb::Channels,
            "topico" | "tópico" | "topic" => Verb::Topic,
            "ajuda" | "help" => Verb::Help,
            _ => return None,
        };
        Some(verb)
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Verb::NotifyMissing | Verb::NotifyCoordinators)
    }

    /// The word shown in replies.
    pub fn keyword(self) -> &'static str {
        match self {
            Verb::Report => "relatorio",
            Verb::QueueStatus => "status",
            Verb::Coverage => "controle",
            Verb::NotifyMissing => "notificar",
            Verb::NotifyCoordinators => "notificar_coordenadores",
            Verb::Channels => "canais",
            Verb::Topic => "topico",
            Verb::Help => "ajuda",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub args: JobArgs,
    pub origin_channel_id: ChannelId,
    pub raw_text: String,
    pub sender: Sender,
}

fn is_omit_dashboard_flag(token: &str) -> bool {
    matches!(
        token.trim_start_matches("--"),
        "sem-dashboard" | "no-dashboard"
    )
}

/// Parse `text` as a command. Returns `None` for anything that is not exactly
/// a known verb, optionally followed by one recognised flag.
pub fn parse_command(prefix: &str, text: &str) -> Option<(Verb, JobArgs)> {
    let lowered = text.trim().to_lowercase();
    let rest = lowered.strip_prefix(&prefix.to_lowercase())?;
    let mut tokens = rest.split_whitespace();
    let verb = Verb::from_word(tokens.next()?)?;
    let flag = tokens.next();
    if tokens.next().is_some() {
        return None;
    }
    match flag {
        None => Some((verb, JobArgs::default())),
        Some(token) if verb == Verb::Report && is_omit_dashboard_flag(token) => {
            Some((verb, JobArgs { omit_dashboard: true }))
        }
        Some(_) => None,
    }
}

/// Senders allowed to issue commands. Empty means everyone.
#[derive(Debug, Clone, Default)]
pub struct SenderAllowList {
    entries: HashSet<String>,
}

impl SenderAllowList {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn permits(&self, sender: &Sender) -> bool {
        self.entries.is_empty()
            || self.entries.contains(&sender.id.to_lowercase())
            || self.entries.contains(&sender.name.to_lowercase())
    }
}

pub struct CommandDispatcher {
    prefix: String,
    admin_channel: ChannelId,
    notification_channel: Option<ChannelId>,
    allow: SenderAllowList,
    registry: ChannelRegistry,
    queue: JobQueue,
    sink: NotificationSink,
    reports: Arc<dyn ReportSystem>,
}

impl CommandDispatcher {
    pub fn new(
        cfg: &CommandConfig,
        admin_channel: ChannelId,
        registry: ChannelRegistry,
        queue: JobQueue,
        sink: NotificationSink,
        reports: Arc<dyn ReportSystem>,
    ) -> Self {
        Self {
            prefix: cfg.prefix.clone(),
            admin_channel,
            notification_channel: cfg.notification_channel_id.clone(),
            allow: SenderAllowList::new(&cfg.authorized_senders),
            registry,
            queue,
            sink,
            reports,
        }
    }

    pub fn parse(&self, message: &InboundMessage) -> Option<Command> {
        let (verb, args) = parse_command(&self.prefix, &message.content)?;
        Some(Command {
            verb,
            args,
            origin_channel_id: message.channel_id.clone(),
            raw_text: message.content.clone(),
            sender: Sender {
                id: message.author_id.clone(),
                name: message.author_name.clone(),
            },
        })
    }

    /// Entry point for the poller's messages. Never fails: unexpected errors
    /// are logged and answered with a generic message.
    pub async fn handle_message(&self, message: InboundMessage) -> bool {
        let Some(command) = self.parse(&message) else {
            return false;
        };
        let channel_id = command.origin_channel_id.clone();
        let raw = command.raw_text.clone();
        match self.dispatch(command).await {
            Ok(handled) => handled,
            Err(e) => {
                error!(
                    "[dispatch] Command `{}` in channel {} failed: {:#}",
                    raw, channel_id, e
                );
                self.reply(&channel_id, messages::GENERIC_ERROR).await;
                false
            }
        }
    }

    /// Run one command. `Ok(false)` means it was refused.
    pub async fn dispatch(&self, command: Command) -> Result<bool> {
        let channel_id = &command.origin_channel_id;
        if !self.allow.permits(&command.sender) {
            debug!(
                "[dispatch] Ignoring `{}` from unlisted sender {} ({})",
                command.raw_text, command.sender.name, command.sender.id
            );
            return Ok(false);
        }
        if command.verb.is_admin() && *channel_id != self.admin_channel {
            info!(
                "[dispatch] Refused `{}` from {} in non-admin channel {}",
                command.verb.keyword(),
                command.sender.name,
                channel_id
            );
            self.reply(
                channel_id,
                &messages::admin_only(&self.prefix, command.verb.keyword()),
            )
            .await;
            return Ok(false);
        }

        info!(
            "[dispatch] `{}` from {} in channel {}",
            command.verb.keyword(),
            command.sender.name,
            channel_id
        );
        match command.verb {
            Verb::Report => self.request_report(channel_id, command.args).await?,
            Verb::QueueStatus => {
                let status = self.queue.status().await;
                self.reply(channel_id, &messages::queue_status(&status)).await;
            }
            Verb::Coverage => self.coverage(channel_id).await,
            Verb::NotifyMissing | Verb::NotifyCoordinators => {
                self.broadcast(channel_id, command.verb).await
            }
            Verb::Channels => {
                let channels = self.registry.active_channels().await;
                self.reply(channel_id, &messages::channel_list(&channels)).await;
            }
            Verb::Topic => {
                let channel = self.registry.get(channel_id).await;
                self.reply(channel_id, &messages::topic(channel.as_ref(), &self.prefix))
                    .await;
            }
            Verb::Help => self.reply(channel_id, &messages::help(&self.prefix)).await,
        }
        Ok(true)
    }

    async fn request_report(&self, channel_id: &ChannelId, args: JobArgs) -> Result<()> {
        let Some(channel) = self.registry.get(channel_id).await else {
            info!("[dispatch] Report requested in unconfigured channel {}", channel_id);
            let active = self.registry.active_channels().await;
            self.reply(channel_id, &messages::channel_not_configured(channel_id, &active))
                .await;
            return Ok(());
        };
        if !channel.active {
            self.reply(channel_id, &messages::reports_disabled(&channel.project_name))
                .await;
            return Ok(());
        }
        if channel.project_id.trim().is_empty() {
            warn!("[dispatch] Channel {} has no project id", channel_id);
            self.reply(channel_id, &messages::project_incomplete(&channel.project_name))
                .await;
            return Ok(());
        }

        let result = self
            .queue
            .enqueue(
                channel_id.clone(),
                channel.project_id.clone(),
                channel.project_name.clone(),
                args,
            )
            .await?;
        let text = match result {
            EnqueueResult::Created {
                job_id,
                starts_now: true,
                ..
            } => messages::intake_started(&channel.project_name, job_id),
            EnqueueResult::Created {
                job_id, position, ..
            } => messages::intake_queued(&channel.project_name, job_id, position),
            EnqueueResult::AlreadyActive {
                job_id,
                status,
                position,
                elapsed,
            } => messages::intake_duplicate(&channel.project_name, job_id, status, position, elapsed),
        };
        self.reply(channel_id, &text).await;
        Ok(())
    }

    async fn coverage(&self, channel_id: &ChannelId) {
        match self.reports.coverage().await {
            Ok(summary) => self.reply(channel_id, &messages::coverage(&summary)).await,
            Err(e) => {
                warn!("[dispatch] Coverage summary failed: {:#}", e);
                self.reply(channel_id, &messages::coverage_unavailable()).await;
            }
        }
    }

    async fn broadcast(&self, channel_id: &ChannelId, verb: Verb) {
        let (what, target) = match verb {
            Verb::NotifyMissing => (
                "the missing-report notice",
                self.notification_channel
                    .clone()
                    .unwrap_or_else(|| self.admin_channel.clone()),
            ),
            _ => ("coordinator notices", self.admin_channel.clone()),
        };
        self.reply(channel_id, &messages::broadcast_started(what, &target))
            .await;
        let result = match verb {
            Verb::NotifyMissing => self.reports.notify_missing(&target).await,
            _ => self.reports.notify_coordinators(&target).await,
        };
        let delivered = match result {
            Ok(delivered) => delivered,
            Err(e) => {
                error!("[dispatch] Sending {} failed: {:#}", what, e);
                false
            }
        };
        info!(
            "[dispatch] Sent {} to channel {}: {}",
            what,
            target,
            if delivered { "ok" } else { "failed" }
        );
        self.reply(channel_id, &messages::broadcast_finished(what, &target, delivered))
            .await;
    }

    /// Replies are best effort; the sink already logged any failure.
    async fn reply(&self, channel_id: &ChannelId, content: &str) {
        let _ = self.sink.send(channel_id, content).await;
    }
}

/// Feeds polled messages to the dispatcher, one task per message.
pub struct DispatchLoop {
    dispatcher: Arc<CommandDispatcher>,
    inbox: Option<mpsc::Receiver<InboundMessage>>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DispatchLoop {
    pub fn new(dispatcher: Arc<CommandDispatcher>, inbox: mpsc::Receiver<InboundMessage>) -> Self {
        Self {
            dispatcher,
            inbox: Some(inbox),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }
}

async fn run_loop(
    dispatcher: Arc<CommandDispatcher>,
    mut inbox: mpsc::Receiver<InboundMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = inbox.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.handle_message(message).await;
        });
    }
    info!("[dispatch] Command loop stopped");
}

#[async_trait::async_trait]
impl LifecycleComponent for DispatchLoop {
    async fn on_start(&mut self) -> Result<()> {
        let Some(inbox) = self.inbox.take() else {
            anyhow::bail!("dispatch loop already started");
        };
        self.handle = Some(tokio::spawn(run_loop(
            self.dispatcher.clone(),
            inbox,
            self.shutdown.clone(),
        )));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}
