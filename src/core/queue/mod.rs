//! Report job queue.
//!
//! All shared state lives in one `QueueState` behind a single mutex, so the
//! per-channel dedupe check and the append happen atomically. Workers are
//! woken through a counting semaphore: every enqueue adds one permit, every
//! take consumes one.
//!
//! A job leaves `Running` through [`JobQueue::finish`], which only succeeds
//! while the job is still `Running`. Natural completion and the timeout
//! supervisor both go through it; whichever wins sends the notification.

pub mod classify;
pub mod types;
mod worker;

use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use crate::core::channels::{ChannelId, MessageId};
use crate::core::report::JobArgs;

pub use classify::FailureClassifier;
pub use types::{
    EnqueueResult, FailureCategory, FailureNotice, Job, JobId, JobOutcome, JobStatus, JobSummary,
    QueueStatus, WorkerSummary, can_transition,
};
pub use worker::{WorkerContext, WorkerPool};

struct QueueState {
    pending: VecDeque<JobId>,
    jobs: HashMap<JobId, Job>,
    active_by_channel: HashMap<ChannelId, JobId>,
    /// Worker slots; `Some` while the worker owns a Running job.
    slots: Vec<Option<JobId>>,
    history: VecDeque<Job>,
    closed: bool,
}

impl QueueState {
    fn running_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn position_of(&self, job_id: JobId) -> usize {
        self.pending
            .iter()
            .position(|id| *id == job_id)
            .unwrap_or(0)
    }

    /// Drops the job from the active indexes and archives it.
    fn retire(&mut self, job_id: JobId, history_limit: usize) -> Option<Job> {
        let job = self.jobs.remove(&job_id)?;
        if self.active_by_channel.get(&job.channel_id) == Some(&job_id) {
            self.active_by_channel.remove(&job.channel_id);
        }
        for slot in self.slots.iter_mut() {
            if *slot == Some(job_id) {
                *slot = None;
            }
        }
        self.history.push_front(job.clone());
        self.history.truncate(history_limit);
        Some(job)
    }
}

struct Shared {
    state: Mutex<QueueState>,
    available: Semaphore,
    history_limit: usize,
}

#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(worker_count: usize, history_limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    jobs: HashMap::new(),
                    active_by_channel: HashMap::new(),
                    slots: vec![None; worker_count],
                    history: VecDeque::new(),
                    closed: false,
                }),
                available: Semaphore::new(0),
                history_limit,
            }),
        }
    }

    /// Submit a report request. A channel with an active job gets that job
    /// back instead of a new one.
    pub async fn enqueue(
        &self,
        channel_id: ChannelId,
        project_id: String,
        project_name: String,
        args: JobArgs,
    ) -> Result<EnqueueResult> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            anyhow::bail!("job queue is shutting down");
        }
        if let Some(existing) = state.active_by_channel.get(&channel_id).copied() {
            if let Some(job) = state.jobs.get(&existing) {
                let position = match job.status {
                    JobStatus::Queued => state.position_of(existing),
                    _ => 0,
                };
                debug!(
                    "[queue] Channel {} already has job {} ({})",
                    channel_id,
                    existing,
                    job.status.as_str()
                );
                return Ok(EnqueueResult::AlreadyActive {
                    job_id: existing,
                    status: job.status,
                    position,
                    elapsed: job.elapsed(),
                });
            }
        }

        let job = Job::new(channel_id.clone(), project_id, project_name, args);
        let job_id = job.id;
        let position = state.pending.len();
        let free = state.slots.len() - state.running_count();
        info!(
            "[queue] Job {} queued for {} (channel {}), position {}",
            job_id, job.project_name, channel_id, position
        );
        state.pending.push_back(job_id);
        state.active_by_channel.insert(channel_id, job_id);
        state.jobs.insert(job_id, job);
        drop(state);

        self.shared.available.add_permits(1);
        Ok(EnqueueResult::Created {
            job_id,
            position,
            starts_now: position < free,
        })
    }

    /// Wait until a job may be available. Returns `false` once the queue is closed.
    pub(crate) async fn wait_for_work(&self) -> bool {
        match self.shared.available.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Bind the head of the queue to `worker` and mark it Running.
    pub(crate) async fn take_next(&self, worker: usize) -> Option<Job> {
        let mut state = self.shared.state.lock().await;
        if state.closed || state.slots.get(worker).copied().flatten().is_some() {
            return None;
        }
        while let Some(job_id) = state.pending.pop_front() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if !can_transition(job.status, JobStatus::Running) {
                continue;
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Instant::now());
            job.worker = Some(worker);
            let started = job.clone();
            state.slots[worker] = Some(job_id);
            return Some(started);
        }
        None
    }

    /// Move a Running job to its terminal state. Returns the finished job only
    /// to the caller that made the transition; later callers get `None`.
    pub async fn finish(&self, job_id: JobId, outcome: JobOutcome) -> Option<Job> {
        let mut state = self.shared.state.lock().await;
        let target = outcome.status();
        let job = state.jobs.get_mut(&job_id)?;
        if job.status != JobStatus::Running || !can_transition(job.status, target) {
            return None;
        }
        job.status = target;
        job.finished_at = Some(Instant::now());
        job.result = Some(outcome);
        state.retire(job_id, self.shared.history_limit)
    }

    /// Returns false once the job has left Running; the id is then dropped.
    pub(crate) async fn set_progress_message(&self, job_id: JobId, message_id: MessageId) -> bool {
        match self.shared.state.lock().await.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => {
                job.progress_message = Some(message_id);
                true
            }
            _ => false,
        }
    }

    /// Stop accepting work and cancel everything still waiting. Running jobs
    /// are left to their workers.
    pub async fn close(&self) -> Vec<Job> {
        let mut state = self.shared.state.lock().await;
        state.closed = true;
        let pending: Vec<JobId> = state.pending.drain(..).collect();
        let mut cancelled = Vec::new();
        for job_id in pending {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            if !can_transition(job.status, JobStatus::Cancelled) {
                continue;
            }
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(Instant::now());
            job.result = Some(JobOutcome::Cancelled {
                reason: "the report service is shutting down".to_string(),
            });
            if let Some(job) = state.retire(job_id, self.shared.history_limit) {
                cancelled.push(job);
            }
        }
        drop(state);
        self.shared.available.close();
        cancelled
    }

    pub async fn get(&self, job_id: JobId) -> Option<Job> {
        let state = self.shared.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .cloned()
            .or_else(|| state.history.iter().find(|j| j.id == job_id).cloned())
    }

    /// Read-only snapshot. Only waits for the queue lock, never for a job.
    pub async fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock().await;
        let running_count = state.running_count();
        let workers = state
            .slots
            .iter()
            .enumerate()
            .map(|(worker_id, slot)| WorkerSummary {
                worker_id,
                job: slot
                    .as_ref()
                    .and_then(|id| state.jobs.get(id))
                    .map(|j| (j.id, j.project_name.clone())),
            })
            .collect();

        let mut jobs: Vec<JobSummary> = state
            .slots
            .iter()
            .flatten()
            .filter_map(|id| state.jobs.get(id))
            .map(|j| JobSummary::of(j, Some(0)))
            .collect();
        jobs.extend(
            state
                .pending
                .iter()
                .filter_map(|id| state.jobs.get(id))
                .enumerate()
                .map(|(pos, j)| JobSummary::of(j, Some(pos))),
        );

        QueueStatus {
            queue_length: state.pending.len(),
            running_count,
            free_workers: state.slots.len() - running_count,
            worker_count: state.slots.len(),
            workers,
            jobs,
            recent: state
                .history
                .iter()
                .map(|j| JobSummary::of(j, None))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests;
