use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::core::channels::{ChannelRegistry, ConfiguredDirectory};
use crate::core::config::AppConfig;
use crate::core::dispatch::{CommandDispatcher, DispatchLoop};
use crate::core::lifecycle::LifecycleManager;
use crate::core::notify::{NotificationSink, RetryPolicy};
use crate::core::poller::{ChannelPoller, PollSettings};
use crate::core::queue::{FailureClassifier, JobQueue, WorkerContext, WorkerPool};
use crate::core::report::process::{ProcessGenerator, ProcessReportSystem};
use crate::core::report::{ReportGenerator, ReportSystem, UnconfiguredReportSystem};
use crate::interfaces::discord::DiscordRest;
use crate::logging::init_logging;

/// Messages waiting between the pollers and the dispatcher.
const INBOX_CAPACITY: usize = 256;

pub async fn run_service(cfg: AppConfig) -> Result<()> {
    init_logging(&cfg.logging);
    info!(
        "Starting reportbot {} ({} worker(s), job timeout {:?})",
        env!("CARGO_PKG_VERSION"),
        cfg.queue.worker_count,
        cfg.queue.job_timeout()
    );

    let admin_channel = cfg
        .commands
        .admin_channel_id
        .clone()
        .context("commands.admin_channel_id is not set")?;

    let discord = Arc::new(DiscordRest::new(&cfg.discord)?);
    let own_user_id = match &cfg.discord.bot_user_id {
        Some(id) => Some(id.clone()),
        None => match discord.current_user_id().await {
            Ok(id) => {
                info!("[discord] Connected as user {}", id);
                Some(id)
            }
            Err(e) => {
                warn!("[discord] Could not look up the bot's own user id: {}", e);
                None
            }
        },
    };

    let directory = Arc::new(ConfiguredDirectory::new(
        cfg.channels.clone(),
        cfg.channels_file.clone(),
    ));
    let registry = ChannelRegistry::new(directory);

    let queue = JobQueue::new(cfg.queue.worker_count, cfg.queue.history_limit);
    let sink = NotificationSink::new(
        discord.clone(),
        RetryPolicy::from_config(&cfg.notifications),
    );
    let generator: Arc<dyn ReportGenerator> =
        Arc::new(ProcessGenerator::from_config(&cfg.generator)?);
    let reports: Arc<dyn ReportSystem> = match &cfg.report_system {
        Some(rs) => Arc::new(ProcessReportSystem::from_config(rs)),
        None => Arc::new(UnconfiguredReportSystem),
    };

    let pool = WorkerPool::new(
        queue.clone(),
        WorkerContext {
            generator,
            sink: sink.clone(),
            classifier: FailureClassifier::new(&cfg.queue.failure_patterns)?,
            job_timeout: cfg.queue.job_timeout(),
            alert_channel: cfg.commands.notification_channel_id.clone(),
        },
        cfg.queue.worker_count,
    );

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let poller = ChannelPoller::new(
        discord.clone(),
        registry.clone(),
        PollSettings::from_config(&cfg.polling),
        own_user_id,
        inbox_tx,
    )
    .with_extra_channel(admin_channel.clone());
    let dispatcher = Arc::new(CommandDispatcher::new(
        &cfg.commands,
        admin_channel,
        registry.clone(),
        queue.clone(),
        sink,
        reports,
    ));

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(pool)));
    lifecycle.attach(Arc::new(Mutex::new(DispatchLoop::new(dispatcher, inbox_rx))));
    lifecycle.attach(Arc::new(Mutex::new(poller.clone())));

    schedule_heartbeat(
        &mut lifecycle,
        poller.clone(),
        queue,
        Duration::from_secs(cfg.polling.heartbeat_secs.max(1)),
    )
    .await;
    schedule_directory_refresh(
        &mut lifecycle,
        poller,
        Duration::from_secs(cfg.polling.directory_refresh_secs.max(1)),
    )
    .await;

    lifecycle.start().await?;
    info!("reportbot is running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down reportbot...");
    lifecycle.shutdown().await?;
    Ok(())
}

async fn schedule_heartbeat(
    lifecycle: &mut LifecycleManager,
    poller: ChannelPoller,
    queue: JobQueue,
    every: Duration,
) {
    match tokio_cron_scheduler::Job::new_repeated_async(every, move |_uuid, mut _l| {
        let poller = poller.clone();
        let queue = queue.clone();
        Box::pin(async move {
            poller.heartbeat().await;
            let status = queue.status().await;
            info!(
                "[queue] Workers busy: {}/{}, waiting: {}",
                status.running_count, status.worker_count, status.queue_length
            );
        })
    }) {
        Ok(job) => {
            if let Err(e) = lifecycle.scheduler.add(job).await {
                error!("Failed to register the heartbeat: {}", e);
            }
        }
        Err(e) => error!("Failed to create the heartbeat job: {}", e),
    }
}

async fn schedule_directory_refresh(
    lifecycle: &mut LifecycleManager,
    poller: ChannelPoller,
    every: Duration,
) {
    match tokio_cron_scheduler::Job::new_repeated_async(every, move |_uuid, mut _l| {
        let poller = poller.clone();
        Box::pin(async move {
            let polling = poller.refresh_directory().await;
            debug!("[directory] Polling {} channel(s) after refresh", polling);
        })
    }) {
        Ok(job) => {
            if let Err(e) = lifecycle.scheduler.add(job).await {
                error!("Failed to register the directory refresh: {}", e);
            }
        }
        Err(e) => error!("Failed to create the directory refresh job: {}", e),
    }
}
