use std::any::Any;
use std::fmt;

/// A centralized error type for all recoverable failures of the crate.
///
/// Runtime invariant violations are *not* represented here, they go through
/// [`fatal`] and never return to the caller.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The host runtime lacks a capability that the selected polling backend
    /// needs. This is a startup error.
    #[error("FATAL: host runtime does not provide `{capability}`")]
    MissingCapability { capability: &'static str },

    /// A configuration value could not be parsed or is out of range.
    #[error("Invalid configuration for {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    /// A polling instance tried to unregister itself from within its own
    /// callback, which would wait forever on its own completion.
    #[error("Polling instance `{name}` cannot be unregistered from its own callback")]
    UnregisterFromCallback { name: String },

    #[error("Queue id {id} out of range, pool has {len} queues")]
    InvalidQueueId { id: usize, len: usize },

    #[error("Queue pool must contain at least one queue")]
    EmptyQueuePool,

    /// The queue provider failed to create a device queue.
    #[error("Queue provider error: {0}")]
    QueueProvider(#[source] anyhow::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn invalid_config(key: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            key,
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::MissingCapability { .. })
    }
}

/// What to do once a runtime invariant has been violated.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalPolicy {
    /// Abort the whole process immediately.
    #[default]
    Abort,

    /// Unwind with a [`FatalError`] payload instead of aborting. Only the
    /// thread driving the failing operation dies, so the caller must observe
    /// the payload with `catch_unwind`. Meant for tests.
    Panic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// A completion handle reported a status outside of the known set.
    InvalidCompletionStatus,

    /// A request was bound from outside of any host task.
    NoCurrentTask,

    /// The pending collection was accessed by two polling contexts at once.
    ConcurrentDrain,

    /// A call into the host runtime or the operating system failed.
    HostCallFailed,
}

/// Panic payload emitted by [`fatal`] under [`FatalPolicy::Panic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub reason: FatalReason,
    pub msg: String,
}

impl FatalError {
    pub fn new(reason: FatalReason, msg: String) -> Self {
        Self { reason, msg }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATAL ({:?}): {}", self.reason, self.msg)
    }
}

impl std::error::Error for FatalError {}

/// Terminates the current operation after an invariant violation. There is no
/// retry: the device or host runtime is in a state that cannot be waited out.
#[track_caller]
#[cold]
pub(crate) fn fatal(policy: FatalPolicy, reason: FatalReason, msg: String) -> ! {
    tracing::error!(?reason, "{}", msg);

    match policy {
        FatalPolicy::Panic => std::panic::panic_any(FatalError::new(reason, msg)),
        FatalPolicy::Abort => std::process::abort(),
    }
}

/// Handles a panic caught on a thread that must never die on its own, like a
/// polling task. Under [`FatalPolicy::Abort`] the process is aborted, under
/// [`FatalPolicy::Panic`] the unwind resumes.
#[cold]
pub(crate) fn escalate(policy: FatalPolicy, context: &str, payload: Box<dyn Any + Send>) -> ! {
    match policy {
        FatalPolicy::Abort => {
            tracing::error!(context, panic = %panic_message(&*payload), "Unrecoverable panic");
            std::process::abort()
        }
        FatalPolicy::Panic => std::panic::resume_unwind(payload),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(err) = payload.downcast_ref::<FatalError>() {
        err.to_string()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
