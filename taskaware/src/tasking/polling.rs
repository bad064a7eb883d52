//! Periodic execution of a callback through one of the host's two polling
//! mechanisms.
//!
//! With polling services the host owns the timing and calls us whenever it
//! sees fit. With polling tasks a dedicated host task runs the callback in a
//! loop and pauses cooperatively for the configured frequency in between.
//! In both cases [`PollingDriver::unregister`] only returns once the callback
//! can never run again.

use crate::errors::{Error, FatalPolicy, FatalReason, escalate, fatal};
use crate::host::{HostRuntime, PollingService};
use crate::utils::ScopeGuard;
use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Pause between two checks of the stopped flag while waiting for a polling
/// task to exit, in microseconds.
const SHUTDOWN_WAIT_US: u64 = 1000;

thread_local! {
    // Address of the `PollingInfo` whose callback runs on this thread, 0 if
    // none.
    static ACTIVE_POLLING: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingBackend {
    /// Host polling services, timed by the host.
    Services,

    /// A dedicated host task pausing with `wait_for` between invocations.
    Tasks,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    Registered = 0,
    Running = 1,
    Suspended = 2,
    Stopping = 3,
    Stopped = 4,
}

impl PollingState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => PollingState::Registered,
            1 => PollingState::Running,
            2 => PollingState::Suspended,
            3 => PollingState::Stopping,
            _ => PollingState::Stopped,
        }
    }
}

type PollingCallback = Box<dyn Fn() + Send + Sync>;

/// One registered polling instance.
pub(crate) struct PollingInfo {
    name: String,

    callback: PollingCallback,

    frequency_us: u64,

    /// Applied to a panic escaping the callback.
    policy: FatalPolicy,

    /// Set by `unregister`, read by the polling loop.
    must_stop: AtomicBool,

    /// Set once by the polling side after its last invocation.
    stopped: AtomicBool,

    state: AtomicU8,
}

impl PollingInfo {
    fn new(name: &str, frequency_us: u64, policy: FatalPolicy, callback: PollingCallback) -> Self {
        Self {
            name: name.to_string(),
            callback,
            frequency_us,
            policy,
            must_stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            state: AtomicU8::new(PollingState::Registered as u8),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Moves to `to` if the current state satisfies `from`. `Stopped` is
    /// final and only ever entered through `mark_stopped`.
    fn transition<F>(&self, to: PollingState, from: F) -> bool
    where
        F: Fn(PollingState) -> bool,
    {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let cur = PollingState::from_u8(cur);
                (cur != PollingState::Stopped && from(cur)).then_some(to as u8)
            })
            .is_ok()
    }

    fn state(&self) -> PollingState {
        PollingState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn must_stop(&self) -> bool {
        self.must_stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.must_stop.store(true, Ordering::Release);
        self.transition(PollingState::Stopping, |_| true);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        self.state.store(PollingState::Stopped as u8, Ordering::Release);
    }

    fn invoke(&self) {
        let previous = ACTIVE_POLLING.with(|active| active.replace(self.addr()));
        let _restore = ScopeGuard::new(|| {
            ACTIVE_POLLING.with(|active| active.set(previous));
            self.transition(PollingState::Suspended, |cur| cur == PollingState::Running);
        });

        self.transition(PollingState::Running, |cur| {
            matches!(cur, PollingState::Registered | PollingState::Suspended)
        });

        // A dead polling thread would leave every bound task locked forever.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.callback)())) {
            escalate(self.policy, &self.name, payload);
        }
    }

    fn is_active_on_this_thread(&self) -> bool {
        ACTIVE_POLLING.with(|active| active.get() == self.addr())
    }
}

impl PollingService for PollingInfo {
    fn poll(&self) -> bool {
        if !self.must_stop() {
            self.invoke();
        }

        // Removal is always explicit through unregister.
        false
    }
}

impl fmt::Debug for PollingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingInfo")
            .field("name", &self.name)
            .field("frequency_us", &self.frequency_us)
            .field("state", &self.state())
            .finish()
    }
}

/// Owning handle to a registered polling instance. Dropping it without
/// calling [`PollingDriver::unregister`] leaves the instance running.
#[derive(Debug)]
pub struct PollingHandle {
    info: Arc<PollingInfo>,

    backend: PollingBackend,
}

impl PollingHandle {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Period between invocations in microseconds. Only honored by
    /// [`PollingBackend::Tasks`].
    pub fn frequency(&self) -> u64 {
        self.info.frequency_us
    }

    pub fn state(&self) -> PollingState {
        self.info.state()
    }

    pub fn backend(&self) -> PollingBackend {
        self.backend
    }

    fn as_service(&self) -> Arc<dyn PollingService> {
        self.info.clone()
    }
}

/// Registers and unregisters polling instances with the backend chosen when
/// the tasking model was created.
pub struct PollingDriver {
    host: Arc<dyn HostRuntime>,

    backend: PollingBackend,

    policy: FatalPolicy,
}

impl PollingDriver {
    /// `backend` must have been probed on `host`.
    pub(crate) fn new(host: Arc<dyn HostRuntime>, backend: PollingBackend, policy: FatalPolicy) -> Self {
        Self {
            host,
            backend,
            policy,
        }
    }

    pub fn backend(&self) -> PollingBackend {
        self.backend
    }

    /// Starts calling `callback` periodically.
    pub fn register<F>(&self, name: &str, frequency_us: u64, callback: F) -> PollingHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let info = Arc::new(PollingInfo::new(
            name,
            frequency_us,
            self.policy,
            Box::new(callback),
        ));
        let handle = PollingHandle {
            info: info.clone(),
            backend: self.backend,
        };

        match self.backend {
            PollingBackend::Services => {
                let Some(services) = self.host.polling_services() else {
                    self.missing("register_polling_service");
                };

                services.register_polling_service(name, handle.as_service());
            }
            PollingBackend::Tasks => self.spawn_polling_task(info),
        }

        tracing::debug!(name, frequency_us, backend = ?self.backend, "Registered polling instance");
        handle
    }

    fn spawn_polling_task(&self, info: Arc<PollingInfo>) {
        let Some(tasks) = self.host.polling_tasks() else {
            self.missing("spawn_function");
        };

        let host = self.host.clone();
        let policy = self.policy;
        let body_info = info.clone();
        let name = info.name.clone();

        let body = move || {
            while !body_info.must_stop() {
                body_info.invoke();

                let Some(tasks) = host.polling_tasks() else {
                    fatal(
                        policy,
                        FatalReason::HostCallFailed,
                        "host runtime lost `wait_for`".to_string(),
                    );
                };
                tasks.wait_for(body_info.frequency_us);
            }
        };

        let on_completion = move || info.mark_stopped();

        tasks.spawn_function(&name, Box::new(body), Box::new(on_completion));
    }

    /// Stops a polling instance and waits until its callback can no longer
    /// run.
    ///
    /// Calling this from inside the instance's own callback cannot wait for
    /// the callback to return. The instance is still asked to stop, but
    /// `Error::UnregisterFromCallback` is returned and with polling services
    /// the instance stays registered with the host as a no-op.
    pub fn unregister(&self, handle: PollingHandle) -> Result<(), Error> {
        let info = &handle.info;
        info.request_stop();

        if info.is_active_on_this_thread() {
            return Err(Error::UnregisterFromCallback {
                name: info.name.clone(),
            });
        }

        match handle.backend {
            PollingBackend::Services => {
                let Some(services) = self.host.polling_services() else {
                    self.missing("unregister_polling_service");
                };

                services.unregister_polling_service(&info.name, &handle.as_service());
                info.mark_stopped();
            }
            PollingBackend::Tasks => {
                let Some(tasks) = self.host.polling_tasks() else {
                    self.missing("wait_for");
                };

                while !info.is_stopped() {
                    tasks.wait_for(SHUTDOWN_WAIT_US);
                }
            }
        }

        tracing::debug!(name = %info.name, "Unregistered polling instance");
        Ok(())
    }

    fn missing(&self, capability: &str) -> ! {
        fatal(
            self.policy,
            FatalReason::HostCallFailed,
            format!("host runtime lost `{}` after startup", capability),
        )
    }
}

impl fmt::Debug for PollingDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingDriver")
            .field("backend", &self.backend)
            .field("policy", &self.policy)
            .finish()
    }
}
