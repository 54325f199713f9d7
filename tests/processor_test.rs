//! Integration tests for memory-gated admission.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use workrelay::error::{Error, ErrorKind};
use workrelay::job::{JobId, JobRequest, Payload, WorkItem};
use workrelay::processor::{ProcessorConfig, ProcessorQueue};
use workrelay::queue::QueueConfig;
use workrelay::transport::MemoryTransport;

const POLL: Duration = Duration::from_secs(2);

fn processor_with(transport: &MemoryTransport, ceiling: u64, depth: usize) -> ProcessorQueue {
    ProcessorQueue::new(
        Arc::new(transport.clone()),
        ProcessorConfig {
            name: "resize".to_string(),
            topic: "site".to_string(),
            max_in_flight_bytes: ceiling,
            queue: QueueConfig {
                max_queue_depth: depth,
                max_job_age: Duration::from_secs(300),
                poll_interval: POLL,
            },
        },
    )
}

fn spawn_process(
    processor: &ProcessorQueue,
    id: &str,
    bytes: usize,
) -> tokio::task::JoinHandle<workrelay::Result<serde_json::Value>> {
    let processor = processor.clone();
    let request = JobRequest::new(id, vec![7u8; bytes]);
    tokio::spawn(async move { processor.process(request).await })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn process_ships_encoded_payload_and_returns_result() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 10);

    let request = JobRequest::new("a", b"0123456789".to_vec()).args(json!({"width": 100}));
    let pushed = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.process(request).await })
    };
    settle().await;

    let message = transport.message_for("a").expect("job should be published");
    assert_eq!(message.id, JobId::from("a"));
    assert_eq!(message.decode_file().unwrap(), b"0123456789");
    assert_eq!(message.action, json!({"width": 100}));
    assert_eq!(message.topic, "site");
    assert_eq!(processor.in_flight_bytes(), 10);

    transport.complete("a", json!({"ok": true}));
    assert_eq!(pushed.await.unwrap().unwrap(), json!({"ok": true}));
    assert_eq!(processor.in_flight_bytes(), 0);
    assert!(!processor.queue().is_pending(&JobId::from("a")));
}

#[tokio::test(start_paused = true)]
async fn worker_failure_reaches_caller_verbatim() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 10);

    let pushed = spawn_process(&processor, "b", 4);
    settle().await;
    transport.fail("b", "boom");

    let err = pushed.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(processor.in_flight_bytes(), 0);
}

// ---------------------------------------------------------------------------
// Memory admission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn admission_waits_while_budget_is_full() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 10, 100);
    let start = Instant::now();

    let first = spawn_process(&processor, "first", 8);
    settle().await;
    let second = spawn_process(&processor, "second", 8);

    tokio::time::sleep(POLL * 2).await;
    assert_eq!(transport.published_ids(), vec![JobId::from("first")]);
    assert_eq!(processor.in_flight_bytes(), 8);

    transport.complete("first", json!(1));
    first.await.unwrap().unwrap();
    settle().await;

    assert!(start.elapsed() >= POLL * 2);
    assert_eq!(transport.published_count(), 2);
    assert_eq!(processor.in_flight_bytes(), 8);

    transport.complete("second", json!(2));
    assert_eq!(second.await.unwrap().unwrap(), json!(2));
    assert_eq!(processor.in_flight_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn jobs_that_fit_together_are_admitted_together() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 10, 100);

    let _a = spawn_process(&processor, "a", 5);
    let _b = spawn_process(&processor, "b", 5);
    settle().await;

    assert_eq!(transport.published_count(), 2);
    assert_eq!(processor.in_flight_bytes(), 10);
}

#[tokio::test(start_paused = true)]
async fn solitary_oversized_job_is_admitted() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 4, 10);

    let big = spawn_process(&processor, "big", 10);
    settle().await;

    assert_eq!(transport.published_count(), 1);
    assert_eq!(processor.in_flight_bytes(), 10);
    assert!(processor.in_flight_bytes() > processor.max_in_flight_bytes());

    transport.complete("big", json!(null));
    big.await.unwrap().unwrap();
    assert_eq!(processor.in_flight_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn budget_returns_to_zero_after_mixed_outcomes() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 100);

    let handles: Vec<_> = (0..6)
        .map(|n| spawn_process(&processor, &format!("job-{n}"), 10 + n))
        .collect();
    settle().await;
    assert_eq!(processor.in_flight_bytes(), (10..16).sum::<usize>() as u64);

    for n in 0..6 {
        let id = format!("job-{n}");
        if n % 2 == 0 {
            transport.complete(&id, json!(n));
        } else {
            transport.fail(&id, "nope");
        }
    }

    let mut completed = 0;
    let mut failed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => completed += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::JobFailed);
                failed += 1;
            }
        }
    }
    assert_eq!((completed, failed), (3, 3));
    assert_eq!(processor.in_flight_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_and_publish_failure_release_the_charge() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 10);

    let silent = spawn_process(&processor, "silent", 100);
    settle().await;
    assert_eq!(processor.in_flight_bytes(), 100);
    assert_eq!(silent.await.unwrap().unwrap_err().kind(), ErrorKind::JobTimeout);
    assert_eq!(processor.in_flight_bytes(), 0);

    transport.set_fail_publish(true);
    let rejected = spawn_process(&processor, "rejected", 100);
    assert!(matches!(rejected.await.unwrap(), Err(Error::Publish { .. })));
    assert_eq!(processor.in_flight_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_admit_releases_the_charge() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 10);

    let pushed = spawn_process(&processor, "cancelled", 64);
    settle().await;
    assert_eq!(processor.in_flight_bytes(), 64);

    pushed.abort();
    let _ = pushed.await;
    assert_eq!(processor.in_flight_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn both_gates_hold_back_independently() {
    let transport = MemoryTransport::new();
    // Depth allows one job, bytes allow plenty.
    let processor = processor_with(&transport, 1024, 1);

    let first = spawn_process(&processor, "first", 1);
    settle().await;
    let _second = spawn_process(&processor, "second", 1);
    settle().await;

    // Second holds its memory charge while it waits on queue depth.
    assert_eq!(transport.published_count(), 1);
    assert_eq!(processor.in_flight_bytes(), 2);

    transport.complete("first", json!(null));
    first.await.unwrap().unwrap();
    settle().await;
    assert_eq!(transport.published_count(), 2);
    assert_eq!(processor.in_flight_bytes(), 1);
}

// ---------------------------------------------------------------------------
// Payload I/O
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unstatable_file_fails_without_charging() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 10);
    let dir = tempfile::tempdir().unwrap();

    let err = processor
        .process(JobRequest::new("missing", dir.path().join("nope.bin")))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PayloadIo { ref id, .. } if id.as_str() == "missing"));
    assert_eq!(processor.in_flight_bytes(), 0);
    assert_eq!(transport.published_count(), 0);
}

#[tokio::test]
async fn file_removed_before_admission_fails_and_releases() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 10);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.bin");
    std::fs::write(&path, b"some bytes").unwrap();

    let item = WorkItem::new(JobRequest::new("race", Payload::File(path.clone())))
        .await
        .unwrap();
    assert_eq!(item.size(), 10);
    std::fs::remove_file(&path).unwrap();

    let err = processor.admit(item).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(processor.in_flight_bytes(), 0);
    assert_eq!(transport.published_count(), 0);
    assert_eq!(processor.queue().stats().submitted, 0);
}

#[tokio::test]
async fn file_payload_is_read_at_admission() {
    let transport = MemoryTransport::new();
    let processor = processor_with(&transport, 1024, 10);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.bin");
    std::fs::write(&path, b"pixels").unwrap();

    let pushed = {
        let processor = processor.clone();
        let request = JobRequest::new("f", path).args(json!({"op": "resize"}));
        tokio::spawn(async move { processor.process(request).await })
    };

    // Real time here: wait for the publish to land.
    let deadline = Instant::now() + Duration::from_secs(5);
    while transport.published_count() == 0 {
        assert!(Instant::now() < deadline, "job was never published");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let message = transport.message_for("f").unwrap();
    assert_eq!(message.decode_file().unwrap(), b"pixels");
    assert_eq!(processor.in_flight_bytes(), 6);

    transport.complete("f", json!({"written": true}));
    assert_eq!(pushed.await.unwrap().unwrap(), json!({"written": true}));
    assert_eq!(processor.in_flight_bytes(), 0);
}
