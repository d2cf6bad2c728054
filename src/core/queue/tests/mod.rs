mod pool;

use std::sync::Arc;
use std::time::Duration;

use super::worker::test_context;
use super::{Job, JobId, JobQueue, WorkerPool};
use crate::core::channels::ChannelId;
use crate::core::report::JobArgs;
use crate::core::test_support::{Behavior, FakeChat, ScriptedGenerator, quick_sink};

pub(super) struct Harness {
    pub queue: JobQueue,
    pub pool: WorkerPool,
    pub chat: Arc<FakeChat>,
    pub generator: Arc<ScriptedGenerator>,
}

pub(super) fn harness(workers: usize, default: Behavior, timeout: Duration) -> Harness {
    let chat = FakeChat::new();
    let generator = ScriptedGenerator::new(default);
    let queue = JobQueue::new(workers, 20);
    let ctx = test_context(generator.clone(), quick_sink(chat.clone()), timeout);
    let pool = WorkerPool::new(queue.clone(), ctx, workers);
    Harness {
        queue,
        pool,
        chat,
        generator,
    }
}

pub(super) async fn submit(queue: &JobQueue, channel: &str, project: &str) -> super::EnqueueResult {
    queue
        .enqueue(
            ChannelId::new(channel),
            project.to_string(),
            format!("Project {}", project),
            JobArgs::default(),
        )
        .await
        .unwrap()
}

/// Poll until the job is terminal; panics after `within`.
pub(super) async fn wait_terminal(queue: &JobQueue, job_id: JobId, within: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if let Some(job) = queue.get(job_id).await {
            if job.status.is_terminal() {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} did not finish within {:?}",
            job_id,
            within
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub(super) async fn wait_running(queue: &JobQueue, count: usize, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    while queue.status().await.running_count < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "fewer than {} jobs running after {:?}",
            count,
            within
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
