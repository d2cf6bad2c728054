use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::core::channels::ChannelId;
use crate::core::queue::classify::{GENERIC_FAILURE, NO_LINK_PRODUCED};
use crate::core::queue::worker::test_context;
use crate::core::queue::{EnqueueResult, JobOutcome, JobQueue, JobStatus, WorkerPool};
use crate::core::test_support::{Behavior, FakeChat, ScriptedGenerator, quick_sink};

use super::{harness, submit, wait_running, wait_terminal};

const WAIT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn scenario_single_request_delivers_both_links() {
    let links = vec![
        "https://docs.example.com/d/1".to_string(),
        "https://dash.example.com/p/1".to_string(),
    ];
    let mut h = harness(2, Behavior::Succeed(links.clone()), Duration::from_secs(5));
    h.pool.spawn_workers();

    let created = submit(&h.queue, "100", "x").await;
    assert!(matches!(
        created,
        EnqueueResult::Created {
            position: 0,
            starts_now: true,
            ..
        }
    ));

    let job = wait_terminal(&h.queue, created.job_id(), WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(JobOutcome::Succeeded { links: links.clone() }));

    h.chat.wait_for_sent(2, WAIT).await;
    let sent = h.chat.sent_to(&ChannelId::new("100")).await;
    let with_links: Vec<_> = sent
        .iter()
        .filter(|m| links.iter().all(|l| m.contains(l.as_str())))
        .collect();
    assert_eq!(with_links.len(), 1, "messages: {:?}", sent);

    // The progress message was turned into a final one-liner.
    let edited = h.chat.edited.lock().await;
    assert_eq!(edited.len(), 1);
    assert!(edited[0].content.contains("finished"));
    drop(edited);
    h.pool.stop().await;
}

#[tokio::test]
async fn scenario_burst_of_three_on_two_workers() {
    let gate = Arc::new(Semaphore::new(0));
    let mut h = harness(
        2,
        Behavior::Gated(gate.clone(), vec!["https://r/1".into()]),
        Duration::from_secs(5),
    );
    h.pool.spawn_workers();

    let ids = vec![
        submit(&h.queue, "1", "a").await.job_id(),
        submit(&h.queue, "2", "b").await.job_id(),
        submit(&h.queue, "3", "c").await.job_id(),
    ];
    wait_running(&h.queue, 2, WAIT).await;
    // Give a third (impossible) start a chance to show up.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let status = h.queue.status().await;
    assert_eq!(status.queue_length, 1);
    assert_eq!(status.running_count, 2);
    assert_eq!(status.free_workers, 0);
    assert_eq!(h.queue.get(ids[2]).await.unwrap().status, JobStatus::Queued);

    gate.add_permits(3);
    for id in ids {
        let job = wait_terminal(&h.queue, id, WAIT).await;
        assert_eq!(job.status, JobStatus::Succeeded);
    }
    assert_eq!(h.generator.max_in_flight.load(Ordering::SeqCst), 2);
    h.pool.stop().await;
}

#[tokio::test]
async fn running_jobs_never_exceed_worker_count() {
    let mut h = harness(
        3,
        Behavior::Sleep(Duration::from_millis(15), vec!["https://r".into()]),
        Duration::from_secs(5),
    );
    h.pool.spawn_workers();

    let mut ids = Vec::new();
    for i in 0..12 {
        ids.push(submit(&h.queue, &i.to_string(), &format!("p{}", i)).await.job_id());
    }
    for _ in 0..10 {
        assert!(h.queue.status().await.running_count <= 3);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for id in ids {
        wait_terminal(&h.queue, id, WAIT).await;
    }
    assert!(h.generator.max_in_flight.load(Ordering::SeqCst) <= 3);
    h.pool.stop().await;
}

#[tokio::test]
async fn single_worker_starts_jobs_in_submission_order() {
    let mut h = harness(1, Behavior::Succeed(vec!["https://r".into()]), Duration::from_secs(5));
    let mut ids = Vec::new();
    for p in ["a", "b", "c", "d"] {
        ids.push(submit(&h.queue, &format!("{}", p.as_bytes()[0]), p).await.job_id());
    }
    h.pool.spawn_workers();
    for id in ids {
        wait_terminal(&h.queue, id, WAIT).await;
    }
    assert_eq!(h.generator.call_order().await, vec!["a", "b", "c", "d"]);
    h.pool.stop().await;
}

#[tokio::test]
async fn generator_error_is_reported_generically_and_queue_continues() {
    let mut h = harness(1, Behavior::Succeed(vec!["https://ok".into()]), Duration::from_secs(5));
    h.generator
        .script("broken", Behavior::Error("spawn failed: os error 2 /secret/path".into()));
    h.pool.spawn_workers();

    let bad = submit(&h.queue, "1", "broken").await.job_id();
    let good = submit(&h.queue, "2", "fine").await.job_id();

    let failed = wait_terminal(&h.queue, bad, WAIT).await;
    assert_eq!(failed.status, JobStatus::Failed);
    let ok = wait_terminal(&h.queue, good, WAIT).await;
    assert_eq!(ok.status, JobStatus::Succeeded);

    h.chat.wait_for_sent(4, WAIT).await;
    let sent = h.chat.sent_to(&ChannelId::new("1")).await;
    assert!(sent.iter().any(|m| m.contains(GENERIC_FAILURE)));
    assert!(sent.iter().all(|m| !m.contains("/secret/path")));
    h.pool.stop().await;
}

#[tokio::test]
async fn zero_exit_without_link_is_a_failure() {
    let mut h = harness(1, Behavior::Succeed(vec![]), Duration::from_secs(5));
    h.pool.spawn_workers();
    let id = submit(&h.queue, "1", "nolink").await.job_id();
    let job = wait_terminal(&h.queue, id, WAIT).await;
    assert_eq!(job.status, JobStatus::Failed);
    match job.result {
        Some(JobOutcome::Failed(notice)) => assert_eq!(notice.message, NO_LINK_PRODUCED),
        other => panic!("unexpected result {:?}", other),
    }
    h.pool.stop().await;
}

#[tokio::test]
async fn failures_are_also_reported_to_the_alert_channel() {
    let chat = FakeChat::new();
    let generator = ScriptedGenerator::new(Behavior::Fail {
        exit: 1,
        stderr: "boom".into(),
    });
    let queue = JobQueue::new(1, 10);
    let mut ctx = test_context(generator, quick_sink(chat.clone()), Duration::from_secs(5));
    ctx.alert_channel = Some(ChannelId::new("999"));
    let mut pool = WorkerPool::new(queue.clone(), ctx, 1);
    pool.spawn_workers();

    let id = submit(&queue, "1", "p").await.job_id();
    wait_terminal(&queue, id, WAIT).await;
    chat.wait_for_sent(3, WAIT).await;
    let alerts = chat.sent_to(&ChannelId::new("999")).await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("failed"));
    assert!(!alerts[0].contains("boom"));
    pool.stop().await;
}

#[tokio::test]
async fn stop_cancels_queued_and_running_jobs() {
    let mut h = harness(1, Behavior::Hang, Duration::from_secs(30));
    h.pool.spawn_workers();
    let running = submit(&h.queue, "1", "a").await.job_id();
    let waiting = submit(&h.queue, "2", "b").await.job_id();
    wait_running(&h.queue, 1, WAIT).await;

    h.pool.stop().await;

    assert_eq!(h.queue.get(running).await.unwrap().status, JobStatus::Cancelled);
    assert_eq!(h.queue.get(waiting).await.unwrap().status, JobStatus::Cancelled);
    assert!(
        h.chat
            .sent_to(&ChannelId::new("2"))
            .await
            .iter()
            .any(|m| m.contains("cancelled"))
    );
    assert_eq!(h.generator.in_flight(), 0);
}
