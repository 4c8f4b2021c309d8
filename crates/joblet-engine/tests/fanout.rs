//! Tests for the log fan-out delivery guarantees.

use std::collections::HashMap;

use joblet_core::JobId;
use joblet_engine::JobEvent;
use joblet_engine::JobEvents;
use joblet_engine::LogRecord;
use joblet_engine::StreamKind;

/// Asserts that records form a gapless, monotonically increasing
/// sequence per stream.
fn assert_prefix_closed(records: &[LogRecord]) {
    let mut next: HashMap<StreamKind, u64> = HashMap::new();
    for record in records {
        let expected = next.entry(record.stream).or_insert(0);
        assert_eq!(
            record.seq, *expected,
            "stream {stream:?} skipped from {expected} to {seq}",
            stream = record.stream,
            seq = record.seq,
        );
        *expected += 1;
    }
}

#[tokio::test]
async fn concurrent_publishers_deliver_in_stream_order() {
    let events = JobEvents::new(1 << 20, 4096);
    let id = JobId::new();

    let mut subscription = events.subscribe(true);
    assert!(subscription.history.is_empty());

    // Two pumps publishing concurrently, like the stdout and stderr
    // pumps of a chatty job.
    let stdout = {
        let events = events.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                events.publish_line(id, StreamKind::Stdout, format!("out {i}"));
                if i % 17 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };
    let stderr = {
        let events = events.clone();
        tokio::spawn(async move {
            for i in 0..200 {
                events.publish_line(id, StreamKind::Stderr, format!("err {i}"));
                if i % 13 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    };

    stdout.await.unwrap();
    stderr.await.unwrap();
    events.close();

    let live = subscription.live.as_mut().unwrap();
    let mut received = Vec::new();
    loop {
        match live.recv().await.unwrap() {
            JobEvent::Log(record) => received.push(record),
            JobEvent::Metric(_) => {}
            JobEvent::Closed => break,
        }
    }

    assert_eq!(received.len(), 400);
    assert_prefix_closed(&received);
}

#[tokio::test]
async fn late_subscriber_history_extends_to_a_complete_sequence() {
    let events = JobEvents::new(1 << 20, 4096);
    let id = JobId::new();

    for i in 0..10 {
        events.publish_line(id, StreamKind::Stdout, format!("early {i}"));
    }

    let mut subscription = events.subscribe(true);
    for i in 10..20 {
        events.publish_line(id, StreamKind::Stdout, format!("late {i}"));
    }
    events.close();

    let mut all = subscription.history.clone();
    let live = subscription.live.as_mut().unwrap();
    loop {
        match live.recv().await.unwrap() {
            JobEvent::Log(record) => all.push(record),
            JobEvent::Metric(_) => {}
            JobEvent::Closed => break,
        }
    }

    assert_eq!(all.len(), 20);
    assert_prefix_closed(&all);
    assert!(all.iter().enumerate().all(|(i, r)| r.seq == i as u64));
}
