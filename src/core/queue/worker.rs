use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{FailureClassifier, Job, JobId, JobOutcome, JobQueue};
use crate::core::channels::ChannelId;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::messages;
use crate::core::notify::NotificationSink;
use crate::core::report::{GenerationRequest, ReportGenerator};

/// How long shutdown waits for workers to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Everything a worker needs besides the queue.
pub struct WorkerContext {
    pub generator: Arc<dyn ReportGenerator>,
    pub sink: NotificationSink,
    pub classifier: FailureClassifier,
    pub job_timeout: Duration,
    /// Failed and timed-out jobs are also reported here.
    pub alert_channel: Option<ChannelId>,
}

pub struct WorkerPool {
    queue: JobQueue,
    ctx: Arc<WorkerContext>,
    worker_count: usize,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, ctx: WorkerContext, worker_count: usize) -> Self {
        Self {
            queue,
            ctx: Arc::new(ctx),
            worker_count,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn spawn_workers(&mut self) {
        for worker_id in 0..self.worker_count {
            let queue = self.queue.clone();
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            self.handles.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, ctx, shutdown).await;
            }));
        }
        info!("[worker] Started {} worker(s)", self.worker_count);
    }

    /// Cancel queued jobs, stop running ones and wait for the workers.
    pub async fn stop(&mut self) {
        let cancelled = self.queue.close().await;
        for job in &cancelled {
            info!("[worker] Job {} cancelled before it started", job.id);
            notify_terminal(&self.ctx, job).await;
        }
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                warn!("[worker] A worker did not stop within {:?}", SHUTDOWN_GRACE);
            }
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for WorkerPool {
    async fn on_start(&mut self) -> Result<()> {
        self.spawn_workers();
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.stop().await;
        Ok(())
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: JobQueue,
    ctx: Arc<WorkerContext>,
    shutdown: CancellationToken,
) {
    loop {
        let has_work = tokio::select! {
            _ = shutdown.cancelled() => false,
            ready = queue.wait_for_work() => ready,
        };
        if !has_work {
            break;
        }
        let Some(job) = queue.take_next(worker_id).await else {
            continue;
        };
        run_job(worker_id, &queue, &ctx, &shutdown, job).await;
    }
    info!("[worker] Worker {} stopped", worker_id);
}

async fn run_job(
    worker_id: usize,
    queue: &JobQueue,
    ctx: &Arc<WorkerContext>,
    shutdown: &CancellationToken,
    job: Job,
) {
    info!(
        "[worker] Worker {} started job {} for {} (channel {})",
        worker_id, job.id, job.project_name, job.channel_id
    );
    let cancel = CancellationToken::new();
    let supervisor_done = CancellationToken::new();
    spawn_supervisor(
        queue.clone(),
        ctx.clone(),
        job.id,
        cancel.clone(),
        supervisor_done.clone(),
    );

    if let Ok(message_id) = ctx
        .sink
        .send(&job.channel_id, &messages::job_running(&job.project_name, job.id))
        .await
    {
        if !queue.set_progress_message(job.id, message_id).await {
            // Finalized while the message was in flight.
            if let Some(done) = queue.get(job.id).await {
                let _ = ctx
                    .sink
                    .update(&job.channel_id, message_id, &messages::progress_final(&done))
                    .await;
            }
        }
    }
    if cancel.is_cancelled() {
        supervisor_done.cancel();
        info!(
            "[worker] Worker {} dropped job {}: it ended before generation started",
            worker_id, job.id
        );
        return;
    }

    let request = GenerationRequest {
        channel_id: job.channel_id.clone(),
        project_id: job.project_id.clone(),
        args: job.args.clone(),
    };
    let outcome = tokio::select! {
        result = ctx.generator.generate(&request, cancel.child_token()) => match result {
            Ok(output) => {
                if !output.succeeded() {
                    warn!(
                        "[worker] Job {} generator exited with {:?}: {}",
                        job.id,
                        output.exit_code,
                        output.stderr.trim()
                    );
                }
                Some(ctx.classifier.classify_output(&output))
            }
            Err(e) => {
                error!("[worker] Job {} generator error: {:#}", job.id, e);
                Some(ctx.classifier.classify_error(&e))
            }
        },
        _ = cancel.cancelled() => None,
        _ = shutdown.cancelled() => Some(JobOutcome::Cancelled {
            reason: "the report service is shutting down".to_string(),
        }),
    };
    supervisor_done.cancel();
    // Stops the generator if this worker is bailing out.
    cancel.cancel();

    let Some(outcome) = outcome else {
        info!("[worker] Worker {} released timed-out job {}", worker_id, job.id);
        return;
    };
    match queue.finish(job.id, outcome).await {
        Some(done) => {
            info!(
                "[worker] Job {} finished as {} in {}",
                done.id,
                done.status.as_str(),
                messages::format_elapsed(done.elapsed())
            );
            notify_terminal(ctx, &done).await;
        }
        None => info!("[worker] Job {} was already finalized", job.id),
    }
}

/// Forces the job to TimedOut if it is still Running after the timeout.
fn spawn_supervisor(
    queue: JobQueue,
    ctx: Arc<WorkerContext>,
    job_id: JobId,
    cancel: CancellationToken,
    done: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::time::sleep(ctx.job_timeout) => {
                if let Some(timed_out) = queue.finish(job_id, JobOutcome::TimedOut).await {
                    cancel.cancel();
                    warn!(
                        "[worker] Job {} for {} timed out after {:?}",
                        job_id, timed_out.project_name, ctx.job_timeout
                    );
                    notify_terminal(&ctx, &timed_out).await;
                }
            }
        }
    });
}

/// Exactly one call per terminal transition.
async fn notify_terminal(ctx: &WorkerContext, job: &Job) {
    if let Some(message_id) = job.progress_message {
        let _ = ctx
            .sink
            .update(&job.channel_id, message_id, &messages::progress_final(job))
            .await;
    }
    if let Err(e) = ctx
        .sink
        .send(&job.channel_id, &messages::terminal(job, ctx.job_timeout))
        .await
    {
        warn!("[worker] Job {} result was not delivered: {}", job.id, e);
    }
    if let (Some(alert_channel), Some(alert)) = (&ctx.alert_channel, messages::admin_alert(job)) {
        if let Err(e) = ctx.sink.send(alert_channel, &alert).await {
            warn!("[worker] Admin alert for job {} was not delivered: {}", job.id, e);
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context(
    generator: Arc<dyn ReportGenerator>,
    sink: NotificationSink,
    job_timeout: Duration,
) -> WorkerContext {
    WorkerContext {
        generator,
        sink,
        classifier: FailureClassifier::builtin().expect("built-in rules compile"),
        job_timeout,
        alert_channel: None,
    }
}
