//! The persistence sink.
//!
//! Log and metric records are forwarded to a co-located persistence
//! daemon over a Unix socket. Records are framed with a 4-byte big-endian
//! length followed by a JSON-tagged body, batched up to a configurable
//! count per write. The sink never blocks a job: when the daemon is slow
//! or absent the in-memory buffer drops its oldest record and counts the
//! drop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::PersistenceConfig;
use crate::events::LogRecord;
use crate::events::MetricSample;

/// The length-prefix size of a framed record.
const FRAME_HEADER_LEN: usize = 4;

/// How long the batcher waits before retrying a failed connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A record shipped to the persistence daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistRecord {
    /// A line of job output.
    Log(LogRecord),
    /// A resource sample.
    Metric(MetricSample),
}

/// Encodes one record into its wire frame.
pub fn encode_frame(record: &PersistRecord) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(record).context("failed to serialize a persistence record")?;
    let len =
        u32::try_from(body.len()).context("persistence record exceeds the maximum frame size")?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decodes one frame from the front of a buffer, returning the record and
/// the number of bytes consumed.
///
/// Returns `Ok(None)` when the buffer does not yet hold a whole frame.
pub fn decode_frame(buffer: &[u8]) -> Result<Option<(PersistRecord, usize)>> {
    if buffer.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes(
        buffer[..FRAME_HEADER_LEN]
            .try_into()
            .expect("slice has the header length"),
    ) as usize;
    let total = FRAME_HEADER_LEN + len;
    if buffer.len() < total {
        return Ok(None);
    }

    let record = serde_json::from_slice(&buffer[FRAME_HEADER_LEN..total])
        .context("failed to parse a persistence record")?;
    Ok(Some((record, total)))
}

/// The buffer shared between record producers and the batcher task.
#[derive(Debug)]
struct Buffer {
    /// The pending records, oldest first.
    queue: Mutex<VecDeque<PersistRecord>>,
    /// Wakes the batcher when records arrive.
    notify: Notify,
    /// The number of records dropped due to back-pressure.
    dropped: AtomicU64,
    /// The buffer capacity in records.
    capacity: usize,
}

/// A handle for enqueueing records to the persistence daemon.
///
/// Cloneable and cheap; every producer (output pumps, samplers) holds
/// one.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    /// The shared buffer.
    buffer: Arc<Buffer>,
}

impl PersistHandle {
    /// Enqueues a record, dropping the oldest buffered record when full.
    pub fn send(&self, record: PersistRecord) {
        {
            let mut queue = self.buffer.queue.lock();
            if queue.len() >= self.buffer.capacity {
                queue.pop_front();
                self.buffer.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(record);
        }
        self.buffer.notify.notify_one();
    }

    /// Gets the number of records dropped so far.
    pub fn dropped(&self) -> u64 {
        self.buffer.dropped.load(Ordering::Relaxed)
    }
}

/// The persistence sink: a background batcher draining the buffer into
/// the daemon's socket.
#[derive(Debug)]
pub struct PersistSink {
    /// The producer handle.
    handle: PersistHandle,
    /// The batcher task.
    task: JoinHandle<()>,
    /// Cancels the batcher.
    cancellation: CancellationToken,
}

impl PersistSink {
    /// Spawns the sink's batcher task.
    pub fn spawn(config: PersistenceConfig) -> Self {
        let buffer = Arc::new(Buffer {
            queue: Mutex::default(),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity: config.buffer_records,
        });
        let handle = PersistHandle {
            buffer: buffer.clone(),
        };
        let cancellation = CancellationToken::new();

        let task = tokio::spawn(run_batcher(config, buffer, cancellation.clone()));
        Self {
            handle,
            task,
            cancellation,
        }
    }

    /// Gets a producer handle.
    pub fn handle(&self) -> PersistHandle {
        self.handle.clone()
    }

    /// Shuts the sink down, attempting a final flush.
    pub async fn shutdown(self) {
        self.cancellation.cancel();
        let _ = self.task.await;
    }
}

/// Runs the batcher loop.
async fn run_batcher(
    config: PersistenceConfig,
    buffer: Arc<Buffer>,
    cancellation: CancellationToken,
) {
    let mut stream: Option<UnixStream> = None;

    loop {
        // Wait for work or shutdown.
        let has_records = { !buffer.queue.lock().is_empty() };
        if !has_records {
            tokio::select! {
                _ = buffer.notify.notified() => {}
                _ = cancellation.cancelled() => break,
            }
        }

        let batch: Vec<PersistRecord> = {
            let mut queue = buffer.queue.lock();
            let take = queue.len().min(config.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            continue;
        }

        if stream.is_none() {
            match UnixStream::connect(&config.socket_path).await {
                Ok(connected) => {
                    debug!(
                        socket = %config.socket_path.display(),
                        "connected to the persistence daemon"
                    );
                    stream = Some(connected);
                }
                Err(e) => {
                    // The records are gone; the daemon was unreachable.
                    buffer
                        .dropped
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    warn!(
                        socket = %config.socket_path.display(),
                        error = %e,
                        dropped = batch.len(),
                        "persistence daemon unreachable; dropped a batch"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        _ = cancellation.cancelled() => break,
                    }
                }
            }
        }

        // SAFETY: the stream was connected just above when absent.
        let connected = stream.as_mut().unwrap();
        if let Err(e) = write_batch(connected, &batch, config.write_timeout).await {
            buffer
                .dropped
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            warn!(
                error = %e,
                dropped = batch.len(),
                "persistence write failed; dropped a batch and reconnecting"
            );
            stream = None;
        }
    }

    // Final flush on shutdown with whatever connection state remains.
    let remaining: Vec<PersistRecord> = {
        let mut queue = buffer.queue.lock();
        queue.drain(..).collect()
    };
    if !remaining.is_empty() {
        let flushed = match stream.as_mut() {
            Some(connected) => write_batch(connected, &remaining, config.write_timeout)
                .await
                .is_ok(),
            None => false,
        };
        if !flushed {
            buffer
                .dropped
                .fetch_add(remaining.len() as u64, Ordering::Relaxed);
            debug!(
                dropped = remaining.len(),
                "persistence records unflushed at shutdown"
            );
        }
    }
}

/// Writes one batch of frames with the configured timeout.
async fn write_batch(
    stream: &mut UnixStream,
    batch: &[PersistRecord],
    write_timeout: Duration,
) -> Result<()> {
    let mut bytes = Vec::new();
    for record in batch {
        bytes.extend_from_slice(&encode_frame(record)?);
    }

    tokio::time::timeout(write_timeout, stream.write_all(&bytes))
        .await
        .context("persistence write timed out")?
        .context("persistence write failed")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::events::StreamKind;

    use joblet_core::JobId;

    /// Builds a log record for tests.
    fn log_record(line: &str) -> PersistRecord {
        PersistRecord::Log(LogRecord {
            job_id: JobId::new(),
            stream: StreamKind::Stdout,
            seq: 0,
            timestamp_ns: 42,
            line: line.to_string(),
        })
    }

    #[test]
    fn frames_round_trip() {
        let record = log_record("hello");
        let frame = encode_frame(&record).unwrap();
        assert_eq!(
            u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize,
            frame.len() - 4
        );

        let (decoded, consumed) = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn partial_frames_are_incomplete() {
        let frame = encode_frame(&log_record("hello")).unwrap();
        assert!(decode_frame(&frame[..3]).unwrap().is_none());
        assert!(decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn buffer_drops_oldest_when_full() {
        let buffer = Arc::new(Buffer {
            queue: Mutex::default(),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity: 2,
        });
        let handle = PersistHandle { buffer };

        handle.send(log_record("a"));
        handle.send(log_record("b"));
        handle.send(log_record("c"));

        assert_eq!(handle.dropped(), 1);
        let queue = handle.buffer.queue.lock();
        let lines: Vec<_> = queue
            .iter()
            .map(|record| match record {
                PersistRecord::Log(log) => log.line.clone(),
                PersistRecord::Metric(_) => unreachable!(),
            })
            .collect();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn records_are_dropped_and_counted_when_the_daemon_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PersistSink::spawn(PersistenceConfig {
            socket_path: dir.path().join("missing.sock"),
            batch_size: 10,
            write_timeout: Duration::from_secs(1),
            buffer_records: 100,
        });

        let handle = sink.handle();
        handle.send(log_record("lost"));

        // The batcher fails to connect and drops the batch; jobs are
        // never blocked by a missing persistence daemon.
        for _ in 0..50 {
            if handle.dropped() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.dropped(), 1);

        sink.shutdown().await;
    }

    #[tokio::test]
    async fn batcher_ships_frames_to_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("persist.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        let sink = PersistSink::spawn(PersistenceConfig {
            socket_path,
            batch_size: 10,
            write_timeout: Duration::from_secs(1),
            buffer_records: 100,
        });

        let expected = log_record("shipped");
        sink.handle().send(expected.clone());

        let (mut server, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        loop {
            let mut chunk = [0u8; 256];
            let n = server.read(&mut chunk).await.unwrap();
            received.extend_from_slice(&chunk[..n]);
            if let Some((decoded, _)) = decode_frame(&received).unwrap() {
                assert_eq!(decoded, expected);
                break;
            }
        }

        sink.shutdown().await;
    }
}
