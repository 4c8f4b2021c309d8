//! Sandbox construction and job execution engine for the Joblet daemon.
//!
//! The engine owns everything between a validated job specification and a
//! terminal job status: cgroup creation, the two-phase sandbox spawn, the
//! isolator that runs as PID 1 inside the sandbox, runtime filesystem
//! composition, named volumes, upload pipes, output fan-out, and the
//! persistence sink.

mod cgroup;
pub mod config;
mod events;
pub mod init;
mod manager;
mod metrics;
mod persist;
mod runtime;
mod sandbox;
mod spawn;
mod upload;
mod volume;

use std::sync::LazyLock;

use sysinfo::CpuRefreshKind;
use sysinfo::MemoryRefreshKind;
use sysinfo::System;

/// Cached information about the host system.
pub(crate) static SYSTEM: LazyLock<System> = LazyLock::new(|| {
    let mut system = System::new();
    system.refresh_cpu_list(CpuRefreshKind::nothing());
    system.refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());
    system
});

pub use cgroup::*;
pub use events::*;
pub use manager::*;
pub use persist::*;
pub use runtime::*;
pub use sandbox::*;
pub use spawn::*;
pub use upload::*;
pub use volume::*;
