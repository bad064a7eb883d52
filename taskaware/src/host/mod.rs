//! Capability interface of the host tasking runtime.
//!
//! The host owns tasks and their pending-event counters. A task whose counter
//! is non-zero when its body finishes keeps its dependencies locked until the
//! counter drops back to zero. That is the only lever this crate pulls: bind a
//! device operation by increasing the counter, release it by decreasing it.
//!
//! Only the event-counter API is mandatory. Polling services, polling tasks
//! and CPU topology are optional capabilities, probed once at startup through
//! the `Option`-returning accessors of [`HostRuntime`].

use bitflags::bitflags;
use std::fmt;
use std::io;
use std::num::NonZeroU64;
use std::sync::Arc;

pub mod threaded;
pub use threaded::{TaskJoin, TaskScope, ThreadedHost, ThreadedHostBuilder};

/// Opaque handle to a task's pending-event counter inside the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(NonZeroU64);

impl TaskHandle {
    pub const fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_raw(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A function the host calls periodically on behalf of a registered service.
pub trait PollingService: Send + Sync {
    /// Returns true once the service is done and must not be called again.
    fn poll(&self) -> bool;
}

/// Native periodic services of the host. The host decides when to call them.
pub trait PollingServices: Send + Sync {
    fn register_polling_service(&self, name: &str, service: Arc<dyn PollingService>);

    /// Removes a service registered under `name`. The service is identified by
    /// pointer, registering the same object twice creates two instances.
    ///
    /// The host guarantees that `service` is not called anymore once this
    /// returns.
    fn unregister_polling_service(&self, name: &str, service: &Arc<dyn PollingService>);
}

/// Spawning of detached functions and cooperative pauses.
pub trait PollingTasks: Send + Sync {
    /// Runs `body` asynchronously as a host task, then `on_completion` once the
    /// task fully completed.
    fn spawn_function(
        &self,
        label: &str,
        body: Box<dyn FnOnce() + Send>,
        on_completion: Box<dyn FnOnce() + Send>,
    );

    /// Pauses the calling task for roughly `micros` microseconds, letting the
    /// host run other work on the same worker. Returns the time actually spent.
    fn wait_for(&self, micros: u64) -> u64;
}

pub trait CpuTopology: Send + Sync {
    fn num_cpus(&self) -> usize;

    fn current_cpu(&self) -> usize;
}

/// Everything a host tasking runtime exposes to this crate.
///
/// Failures inside these calls are unrecoverable. Implementations panic
/// rather than returning errors.
pub trait HostRuntime: Send + Sync + 'static {
    /// The task executing on the calling thread, if any.
    fn current_task(&self) -> Option<TaskHandle>;

    fn increase_task_events(&self, task: TaskHandle, increment: u32);

    /// Decreases the counter and releases the task's dependencies when it
    /// reaches zero after the task body has finished.
    fn decrease_task_events(&self, task: TaskHandle, decrement: u32);

    /// Tells the host that the event-counter API may be used from now on.
    /// Returns false if the host has no such hook.
    fn notify_task_event_api(&self) -> bool {
        false
    }

    fn polling_services(&self) -> Option<&dyn PollingServices> {
        None
    }

    fn polling_tasks(&self) -> Option<&dyn PollingTasks> {
        None
    }

    fn cpu_topology(&self) -> Option<&dyn CpuTopology> {
        None
    }
}

bitflags! {
    /// Optional capabilities found when probing a [`HostRuntime`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        const POLLING_SERVICES = 1;
        const POLLING_TASKS = 1 << 1;
        const CPU_TOPOLOGY = 1 << 2;
        const EVENT_API_NOTIFY = 1 << 3;
    }
}

impl Capabilities {
    /// Probes everything except `EVENT_API_NOTIFY`, which is only known once
    /// the hook has been called.
    pub fn probe(host: &dyn HostRuntime) -> Self {
        let mut caps = Capabilities::empty();

        if host.polling_services().is_some() {
            caps |= Capabilities::POLLING_SERVICES;
        }

        if host.polling_tasks().is_some() {
            caps |= Capabilities::POLLING_TASKS;
        }

        if host.cpu_topology().is_some() {
            caps |= Capabilities::CPU_TOPOLOGY;
        }

        caps
    }
}

/// CPU topology straight from the operating system. Used when the host does
/// not expose its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsCpuTopology;

impl OsCpuTopology {
    pub fn try_num_cpus(&self) -> io::Result<usize> {
        std::thread::available_parallelism().map(|n| n.get())
    }

    #[cfg(target_os = "linux")]
    pub fn try_current_cpu(&self) -> io::Result<usize> {
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(cpu as usize)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn try_current_cpu(&self) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "sched_getcpu is only available on linux",
        ))
    }
}
