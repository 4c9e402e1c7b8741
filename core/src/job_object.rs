//! Windows-path resource confinement: derives kernel job-object limit fields
//! from the session's named limits and hands them to a registered applier
//! after the child is spawned.
//!
//! The kernel applier (CreateJobObject / SetInformationJobObject /
//! AssignProcessToJobObject) is an external collaborator; this module owns
//! the unit conversions and the post-spawn plumbing. The returned handle
//! guard must stay alive for the session's lifetime so the limits persist.

use std::io;
use std::sync::Arc;
use std::sync::OnceLock;

use tracing::warn;

use crate::rlimit::LimitKind;
use crate::rlimit::ResourceLimits;

/// 100-nanosecond ticks per second, the unit job objects count CPU time in.
const TICKS_PER_SECOND: u64 = 10_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLimits {
    /// `cpu` seconds converted to 100-ns ticks
    /// (JOB_OBJECT_LIMIT_PROCESS_TIME).
    pub per_process_user_time_ticks: Option<u64>,

    /// `memory` bytes, passed through (JOB_OBJECT_LIMIT_PROCESS_MEMORY).
    pub process_memory_bytes: Option<u64>,

    /// `nproc` count (JOB_OBJECT_LIMIT_ACTIVE_PROCESS).
    pub active_process_limit: Option<u32>,
}

impl JobLimits {
    /// Converts the named limits, warning for the ones job objects cannot
    /// express.
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        for unsupported in [LimitKind::Fsize, LimitKind::Nofile, LimitKind::Stack] {
            if limits.get(unsupported).is_some() {
                warn!(
                    limit = unsupported.name(),
                    "resource limit is not supported by job objects; ignored"
                );
            }
        }
        Self {
            per_process_user_time_ticks: limits
                .get(LimitKind::Cpu)
                .map(|secs| secs.saturating_mul(TICKS_PER_SECOND)),
            process_memory_bytes: limits.get(LimitKind::Memory),
            active_process_limit: limits
                .get(LimitKind::Nproc)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.per_process_user_time_ticks.is_none()
            && self.process_memory_bytes.is_none()
            && self.active_process_limit.is_none()
    }
}

/// Opaque guard returned by the applier; dropping it is the only close of
/// the job handle.
pub type JobHandle = Box<dyn std::any::Any + Send>;

/// The kernel-side applier: given the child PID and the derived limits,
/// creates the job object, assigns the process, and returns the handle
/// guard.
pub type JobObjectApplier =
    Arc<dyn Fn(u32, &JobLimits) -> io::Result<JobHandle> + Send + Sync>;

static APPLIER: OnceLock<JobObjectApplier> = OnceLock::new();

/// Registers the process-wide job-object applier. Later registrations are
/// ignored; the first one wins.
pub fn register_job_object_applier(applier: JobObjectApplier) {
    let _ = APPLIER.set(applier);
}

/// Applies `limits` to the freshly spawned child. Without a registered
/// applier the limits cannot be enforced, which is only a warning: the
/// env-only sandbox still stands.
pub(crate) fn apply_to_child(pid: u32, limits: &JobLimits) -> io::Result<Option<JobHandle>> {
    if limits.is_empty() {
        return Ok(None);
    }
    match APPLIER.get() {
        Some(applier) => applier(pid, limits).map(Some),
        None => {
            warn!(pid, "no job-object applier registered; resource limits not enforced");
            Ok(None)
        }
    }
}
