//! The per-job resource sampler.
//!
//! While a job runs, a sampler task periodically reads its cgroup's
//! memory, CPU, and PID counters and publishes the sample through the
//! job's fan-out and the persistence sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use joblet_core::JobId;

use crate::cgroup::JobCgroup;
use crate::events::JobEvents;
use crate::events::ResourceUsage;
use crate::persist::PersistHandle;
use crate::persist::PersistRecord;

/// Spawns the resource sampler for a running job.
///
/// The sampler stops when the token is cancelled (job termination); the
/// final state of the cgroup is read by the supervisor, not here.
pub fn spawn_sampler(
    id: JobId,
    cgroup: Arc<JobCgroup>,
    events: Arc<JobEvents>,
    persist: PersistHandle,
    interval: Duration,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so samples reflect a
        // running command.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancellation.cancelled() => break,
            }

            let (io_read_bytes, io_write_bytes) = cgroup.io_bytes().unwrap_or((0, 0));
            let usage = ResourceUsage {
                memory_bytes: cgroup.memory_current().unwrap_or(0),
                cpu_usage_usec: cgroup.cpu_usage_usec().unwrap_or(0),
                pids: cgroup.pids_current().unwrap_or(0),
                io_read_bytes,
                io_write_bytes,
            };

            trace!(job = %id, ?usage, "sampled job resources");
            let sample = events.publish_metric(id, usage);
            persist.send(PersistRecord::Metric(sample));
        }
    })
}
