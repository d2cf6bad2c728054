use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::channels::{ChannelId, MessageId};
use crate::core::report::JobArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    /// First eight hex digits; enough to tell jobs apart in a channel.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Allowed job state changes. Terminal states have no way out.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    match from {
        JobStatus::Queued => matches!(to, JobStatus::Running | JobStatus::Cancelled),
        JobStatus::Running => matches!(
            to,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled
        ),
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled => {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    NotFound,
    Data,
    Authentication,
    Permission,
    Connection,
    Configuration,
    System,
    Timeout,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::NotFound => "not_found",
            FailureCategory::Data => "data",
            FailureCategory::Authentication => "authentication",
            FailureCategory::Permission => "permission",
            FailureCategory::Connection => "connection",
            FailureCategory::Configuration => "configuration",
            FailureCategory::System => "system",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Unknown => "unknown",
        }
    }
}

/// User-facing failure: a category and a short actionable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub category: FailureCategory,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { links: Vec<String> },
    Failed(FailureNotice),
    TimedOut,
    Cancelled { reason: String },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed(_) => JobStatus::Failed,
            JobOutcome::TimedOut => JobStatus::TimedOut,
            JobOutcome::Cancelled { .. } => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub channel_id: ChannelId,
    pub project_id: String,
    pub project_name: String,
    pub args: JobArgs,
    pub status: JobStatus,
    pub enqueued_at: Instant,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub worker: Option<usize>,
    pub progress_message: Option<MessageId>,
    pub result: Option<JobOutcome>,
}

impl Job {
    pub(crate) fn new(
        channel_id: ChannelId,
        project_id: String,
        project_name: String,
        args: JobArgs,
    ) -> Self {
        Self {
            id: JobId::new(),
            channel_id,
            project_id,
            project_name,
            args,
            status: JobStatus::Queued,
            enqueued_at: Instant::now(),
            started_at: None,
            finished_at: None,
            worker: None,
            progress_message: None,
            result: None,
        }
    }

    /// Time spent running, or waiting if the job never started.
    pub fn elapsed(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Instant::now);
        let start = self.started_at.unwrap_or(self.enqueued_at);
        end.saturating_duration_since(start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Created {
        job_id: JobId,
        /// Queued jobs ahead of this one; 0 means it is next.
        position: usize,
        /// A worker was free at submission time.
        starts_now: bool,
    },
    AlreadyActive {
        job_id: JobId,
        status: JobStatus,
        position: usize,
        elapsed: Duration,
    },
}

impl EnqueueResult {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueResult::Created { job_id, .. } | EnqueueResult::AlreadyActive { job_id, .. } => {
                *job_id
            }
        }
    }

    pub fn position(&self) -> usize {
        match self {
            EnqueueResult::Created { position, .. }
            | EnqueueResult::AlreadyActive { position, .. } => *position,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueResult::Created { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: JobId,
    pub channel_id: ChannelId,
    pub project_name: String,
    pub status: JobStatus,
    pub position: Option<usize>,
    pub worker: Option<usize>,
    pub elapsed: Duration,
}

impl JobSummary {
    pub(crate) fn of(job: &Job, position: Option<usize>) -> Self {
        Self {
            job_id: job.id,
            channel_id: job.channel_id.clone(),
            project_name: job.project_name.clone(),
            status: job.status,
            position,
            worker: job.worker,
            elapsed: job.elapsed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub job: Option<(JobId, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub running_count: usize,
    pub free_workers: usize,
    pub worker_count: usize,
    pub workers: Vec<WorkerSummary>,
    /// Running jobs first, then queued jobs in FIFO order.
    pub jobs: Vec<JobSummary>,
    /// Most recent terminal jobs, newest first.
    pub recent: Vec<JobSummary>,
}
