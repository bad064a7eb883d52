//! Device-side view of asynchronous operations.
//!
//! A device queue hands out a [`CompletionHandle`] for each submitted
//! operation. The handle can be queried for its [`CompletionStatus`] at any
//! time without blocking, which is all the request tracker needs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

pub mod pool;
pub use pool::{QueueCount, QueueId, QueuePool, QueueProvider};

const RAW_SUBMITTED: i32 = 0;
const RAW_RUNNING: i32 = 1;
const RAW_COMPLETE: i32 = 2;

/// Value reported by some device runtimes for operations that are still in
/// flight but whose status is not yet known.
const RAW_UNREPORTED: i32 = 3;

/// Execution status of a device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// The operation was submitted to the device but did not start yet.
    Submitted,

    /// The operation is executing on the device.
    Running,

    /// The operation finished. This status is final.
    Complete,

    /// The device runtime has not reported a status yet.
    Unreported,

    /// Anything else. The device runtime is in an inconsistent state.
    Invalid(i32),
}

impl CompletionStatus {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            RAW_SUBMITTED => CompletionStatus::Submitted,
            RAW_RUNNING => CompletionStatus::Running,
            RAW_COMPLETE => CompletionStatus::Complete,
            RAW_UNREPORTED => CompletionStatus::Unreported,
            other => CompletionStatus::Invalid(other),
        }
    }

    pub fn as_raw(&self) -> i32 {
        match self {
            CompletionStatus::Submitted => RAW_SUBMITTED,
            CompletionStatus::Running => RAW_RUNNING,
            CompletionStatus::Complete => RAW_COMPLETE,
            CompletionStatus::Unreported => RAW_UNREPORTED,
            CompletionStatus::Invalid(raw) => *raw,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, CompletionStatus::Complete)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Submitted => write!(f, "submitted"),
            CompletionStatus::Running => write!(f, "running"),
            CompletionStatus::Complete => write!(f, "complete"),
            CompletionStatus::Unreported => write!(f, "unreported"),
            CompletionStatus::Invalid(raw) => write!(f, "invalid({})", raw),
        }
    }
}

/// Opaque reference to an asynchronous device operation.
///
/// Querying the status must never block. Implementations are moved into the
/// polling context, hence the `Send` bound.
pub trait CompletionHandle: Send + 'static {
    fn status(&self) -> CompletionStatus;
}

impl<T: CompletionHandle + Sync> CompletionHandle for Arc<T> {
    fn status(&self) -> CompletionStatus {
        (**self).status()
    }
}

/// A completion handle whose status is driven by user code, the equivalent of
/// a user event in OpenCL. Clones share the same status.
#[derive(Debug, Clone)]
pub struct ManualEvent {
    status: Arc<AtomicI32>,
}

impl ManualEvent {
    /// Creates an event in the `Submitted` state.
    pub fn new() -> Self {
        Self::with_status(CompletionStatus::Submitted)
    }

    pub fn with_status(status: CompletionStatus) -> Self {
        Self {
            status: Arc::new(AtomicI32::new(status.as_raw())),
        }
    }

    pub fn set_status(&self, status: CompletionStatus) {
        self.status.store(status.as_raw(), Ordering::Release);
    }

    pub fn set_running(&self) {
        self.set_status(CompletionStatus::Running);
    }

    pub fn complete(&self) {
        self.set_status(CompletionStatus::Complete);
    }
}

impl Default for ManualEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionHandle for ManualEvent {
    fn status(&self) -> CompletionStatus {
        CompletionStatus::from_raw(self.status.load(Ordering::Acquire))
    }
}
