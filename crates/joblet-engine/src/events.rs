//! The per-job log and metric fan-out.
//!
//! Every line of a job's stdout/stderr (and every resource sample) is
//! published once and delivered to any number of live subscribers plus
//! the persistence sink. A bounded in-memory ring keeps the tail of each
//! output stream so late subscribers receive history before live
//! records.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::broadcast;

use joblet_core::JobId;

/// Which output stream a log record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// The job's standard output.
    Stdout,
    /// The job's standard error.
    Stderr,
}

/// One line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LogRecord {
    /// The job the line belongs to.
    pub job_id: JobId,
    /// The stream the line was read from.
    pub stream: StreamKind,
    /// The per-stream monotonic sequence number, starting at zero.
    pub seq: u64,
    /// The nanosecond timestamp at which the daemon read the line.
    pub timestamp_ns: i64,
    /// The line contents, without the trailing newline.
    pub line: String,
}

/// The resource counters read from a job's cgroup for one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceUsage {
    /// The resident memory, in bytes.
    pub memory_bytes: u64,
    /// The cumulative CPU usage, in microseconds.
    pub cpu_usage_usec: u64,
    /// The number of PIDs.
    pub pids: u64,
    /// The cumulative block I/O read, in bytes.
    pub io_read_bytes: u64,
    /// The cumulative block I/O written, in bytes.
    pub io_write_bytes: u64,
}

/// One resource sample for a running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricSample {
    /// The job the sample belongs to.
    pub job_id: JobId,
    /// The monotonic sample sequence number, starting at zero.
    pub seq: u64,
    /// The nanosecond timestamp of the sample.
    pub timestamp_ns: i64,
    /// The sampled resource counters.
    #[serde(flatten)]
    pub usage: ResourceUsage,
}

/// An event delivered to a job's live subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A line of job output.
    Log(LogRecord),
    /// A resource sample.
    Metric(MetricSample),
    /// The job terminated and its streams are drained; no further events
    /// will arrive.
    Closed,
}

/// The bounded tail ring for one output stream.
#[derive(Debug, Default)]
struct Ring {
    /// The retained records, oldest first.
    records: VecDeque<LogRecord>,
    /// The total line bytes currently retained.
    bytes: usize,
    /// The next sequence number for the stream.
    next_seq: u64,
}

impl Ring {
    /// Appends a record, evicting the oldest records past the byte
    /// capacity.
    fn push(&mut self, record: LogRecord, capacity: usize) {
        self.bytes += record.line.len();
        self.records.push_back(record);
        while self.bytes > capacity && self.records.len() > 1 {
            if let Some(evicted) = self.records.pop_front() {
                self.bytes -= evicted.line.len();
            }
        }
    }
}

/// State shared between publishers and subscribers of one job.
#[derive(Debug)]
struct Shared {
    /// The stdout tail ring.
    stdout: Ring,
    /// The stderr tail ring.
    stderr: Ring,
    /// The metric sample sequence counter.
    metric_seq: u64,
    /// Whether the job has terminated.
    closed: bool,
}

/// A snapshot-plus-live subscription to a job's events.
#[derive(Debug)]
pub struct Subscription {
    /// The retained history, in publish order per stream.
    pub history: Vec<LogRecord>,
    /// The live event receiver; `None` when the subscriber asked only for
    /// history or the job is already closed.
    pub live: Option<broadcast::Receiver<JobEvent>>,
}

/// The fan-out hub for one job.
///
/// Publishing and subscribing synchronise on one lock so a subscriber's
/// history snapshot and its live receiver form an exact, gap-free and
/// duplicate-free prefix of the job's record sequence.
#[derive(Debug)]
pub struct JobEvents {
    /// The shared ring state.
    shared: Mutex<Shared>,
    /// The live broadcast channel.
    tx: broadcast::Sender<JobEvent>,
    /// The ring byte capacity per stream.
    ring_bytes: usize,
}

impl JobEvents {
    /// Creates a fan-out hub with the given per-stream ring capacity and
    /// live channel capacity.
    pub fn new(ring_bytes: usize, channel_capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(channel_capacity);
        Arc::new(Self {
            shared: Mutex::new(Shared {
                stdout: Ring::default(),
                stderr: Ring::default(),
                metric_seq: 0,
                closed: false,
            }),
            tx,
            ring_bytes,
        })
    }

    /// Publishes one line of output, assigning its sequence number.
    ///
    /// Returns the completed record so the caller can forward it to the
    /// persistence sink.
    pub fn publish_line(&self, job_id: JobId, stream: StreamKind, line: String) -> LogRecord {
        let mut shared = self.shared.lock();
        let ring = match stream {
            StreamKind::Stdout => &mut shared.stdout,
            StreamKind::Stderr => &mut shared.stderr,
        };

        let record = LogRecord {
            job_id,
            stream,
            seq: ring.next_seq,
            timestamp_ns: now_ns(),
            line,
        };
        ring.next_seq += 1;
        ring.push(record.clone(), self.ring_bytes);

        // Send while holding the lock: a receiver created under the same
        // lock sees exactly the records published after its snapshot.
        let _ = self.tx.send(JobEvent::Log(record.clone()));
        record
    }

    /// Publishes one resource sample, assigning its sequence number.
    pub fn publish_metric(&self, job_id: JobId, usage: ResourceUsage) -> MetricSample {
        let mut shared = self.shared.lock();
        let sample = MetricSample {
            job_id,
            seq: shared.metric_seq,
            timestamp_ns: now_ns(),
            usage,
        };
        shared.metric_seq += 1;

        let _ = self.tx.send(JobEvent::Metric(sample));
        sample
    }

    /// Marks the job's streams closed and notifies live subscribers.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        if !shared.closed {
            shared.closed = true;
            let _ = self.tx.send(JobEvent::Closed);
        }
    }

    /// Subscribes to the job's events.
    ///
    /// The returned history holds the ring snapshot (stdout records then
    /// stderr records, each in sequence order); when `follow` is set and
    /// the job is still live, subsequent events arrive on the live
    /// receiver.
    pub fn subscribe(&self, follow: bool) -> Subscription {
        let shared = self.shared.lock();

        let mut history =
            Vec::with_capacity(shared.stdout.records.len() + shared.stderr.records.len());
        history.extend(shared.stdout.records.iter().cloned());
        history.extend(shared.stderr.records.iter().cloned());

        let live = if follow && !shared.closed {
            Some(self.tx.subscribe())
        } else {
            None
        };

        Subscription { history, live }
    }
}

/// Gets the current wall-clock time in nanoseconds since the epoch.
fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sequences_are_per_stream_and_monotonic() {
        let events = JobEvents::new(1024, 16);
        let id = JobId::new();

        let a = events.publish_line(id, StreamKind::Stdout, "a".to_string());
        let b = events.publish_line(id, StreamKind::Stderr, "b".to_string());
        let c = events.publish_line(id, StreamKind::Stdout, "c".to_string());

        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 0);
        assert_eq!(c.seq, 1);
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let events = JobEvents::new(8, 16);
        let id = JobId::new();

        for i in 0..4 {
            events.publish_line(id, StreamKind::Stdout, format!("line{i}"));
        }

        let subscription = events.subscribe(false);
        // 8 bytes holds one 5-byte line plus the newest push before
        // eviction settles back under capacity.
        let lines: Vec<_> = subscription
            .history
            .iter()
            .map(|r| r.line.as_str())
            .collect();
        assert_eq!(lines, vec!["line3"]);
        assert!(subscription.live.is_none());
    }

    #[tokio::test]
    async fn snapshot_then_live_has_no_gap_or_duplicate() {
        let events = JobEvents::new(1024, 16);
        let id = JobId::new();

        events.publish_line(id, StreamKind::Stdout, "before".to_string());
        let mut subscription = events.subscribe(true);
        events.publish_line(id, StreamKind::Stdout, "after".to_string());
        events.close();

        assert_eq!(subscription.history.len(), 1);
        assert_eq!(subscription.history[0].line, "before");

        let live = subscription.live.as_mut().unwrap();
        match live.recv().await.unwrap() {
            JobEvent::Log(record) => {
                assert_eq!(record.line, "after");
                assert_eq!(record.seq, 1);
            }
            other => panic!("expected a log event, got {other:?}"),
        }
        assert_eq!(live.recv().await.unwrap(), JobEvent::Closed);
    }

    #[test]
    fn subscribing_after_close_yields_no_live_channel() {
        let events = JobEvents::new(1024, 16);
        let id = JobId::new();
        events.publish_line(id, StreamKind::Stdout, "done".to_string());
        events.close();

        let subscription = events.subscribe(true);
        assert_eq!(subscription.history.len(), 1);
        assert!(subscription.live.is_none());
    }
}
