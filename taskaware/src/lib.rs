//! Lets cooperative tasks wait on asynchronous device operations without
//! blocking a worker thread.
//!
//! A task binds a device completion handle to itself, which bumps its
//! pending-event counter in the host tasking runtime. A polling instance
//! periodically checks every bound handle and decrements the owner's counter
//! once the operation completed, which releases the task's dependencies.

pub mod config;
pub use config::{Builder, Config};

pub mod device;
pub use device::{
    CompletionHandle, CompletionStatus, ManualEvent, QueueCount, QueueId, QueuePool,
    QueueProvider,
};

mod environment;
pub use environment::Environment;

pub mod errors;
pub use errors::{Error, FatalError, FatalPolicy, FatalReason};

pub mod host;
pub use host::{HostRuntime, TaskHandle, ThreadedHost};

pub mod requests;
pub use requests::{Request, RequestId, TickStats};

pub mod tasking;
pub use tasking::{PollingBackend, PollingHandle, PollingState, TaskingModel};

mod utils;

#[cfg(test)]
mod test_utils;
