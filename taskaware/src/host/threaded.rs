//! A host runtime where every task is an OS thread.
//!
//! Good enough to run the bridge end to end without an external tasking
//! runtime: tasks own pending-event counters, their dependencies are released
//! once the body returned and the counter dropped to zero, and both polling
//! backends are available.

use crate::host::{
    Capabilities, CpuTopology, HostRuntime, OsCpuTopology, PollingService, PollingServices,
    PollingTasks, TaskHandle,
};
use crate::errors::panic_message;
use crate::utils::ScopeGuard;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Task handles are unique across every host of the process, so a thread-local
/// current task can never be mistaken for a task of another host.
static NEXT_TASK: AtomicU64 = AtomicU64::new(1);

const SERVICE_INTERVAL: Duration = Duration::from_micros(200);

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskHandle>> = const { Cell::new(None) };
}

#[derive(Debug, Default)]
struct EventState {
    pending: u64,

    /// The task body returned.
    finished: bool,

    /// Dependencies were released. Final.
    released: bool,
}

#[derive(Debug)]
struct TaskEvents {
    label: String,

    state: Mutex<EventState>,

    on_release: Condvar,
}

impl TaskEvents {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            state: Mutex::new(EventState::default()),
            on_release: Condvar::new(),
        }
    }

    /// Blocks until released. Returns false if `timeout` elapsed first.
    fn wait_released(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        let deadline = timeout.map(|t| Instant::now() + t);

        while !state.released {
            match deadline {
                Some(deadline) => {
                    if self.on_release.wait_until(&mut state, deadline).timed_out() {
                        return state.released;
                    }
                }
                None => self.on_release.wait(&mut state),
            }
        }

        true
    }
}

type ServiceEntry = (String, Arc<dyn PollingService>);

struct Inner {
    caps: Capabilities,

    num_cpus: usize,

    tasks: DashMap<TaskHandle, Arc<TaskEvents>>,

    /// Held for the whole duration of a service round, which is what makes
    /// unregister wait for in-flight calls.
    services: Mutex<Vec<ServiceEntry>>,

    service_thread: Mutex<Option<JoinHandle<()>>>,

    service_interval: Duration,

    notified: AtomicBool,

    shutdown: AtomicBool,
}

impl Inner {
    fn new_task(&self, label: &str) -> (TaskHandle, Arc<TaskEvents>) {
        let raw = NEXT_TASK.fetch_add(1, Ordering::Relaxed);
        let task = TaskHandle::from_raw(raw).unwrap_or_else(|| panic!("task handle overflow"));

        let events = Arc::new(TaskEvents::new(label));
        self.tasks.insert(task, events.clone());

        (task, events)
    }

    #[track_caller]
    fn events(&self, task: TaskHandle) -> Arc<TaskEvents> {
        match self.tasks.get(&task) {
            Some(events) => events.value().clone(),
            None => panic!("unknown or already released task {}", task),
        }
    }

    fn finish(&self, task: TaskHandle, events: &TaskEvents) {
        let mut state = events.state.lock();
        state.finished = true;
        self.maybe_release(task, events, &mut state);
    }

    fn maybe_release(&self, task: TaskHandle, events: &TaskEvents, state: &mut EventState) {
        if state.finished && state.pending == 0 && !state.released {
            state.released = true;
            self.tasks.remove(&task);
            events.on_release.notify_all();
        }
    }

    fn ensure_service_thread(self: &Arc<Self>) {
        let mut slot = self.service_thread.lock();
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.service_interval;
        let thread = std::thread::Builder::new()
            .name("taskaware-services".to_string())
            .spawn(move || run_services(weak, interval))
            .unwrap_or_else(|e| panic!("failed to spawn service thread: {}", e));

        *slot = Some(thread);
    }
}

fn run_services(inner: Weak<Inner>, interval: Duration) {
    loop {
        {
            let Some(inner) = inner.upgrade() else {
                return;
            };

            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }

            let mut services = inner.services.lock();
            services.retain(poll_service);
        }

        std::thread::sleep(interval);
    }
}

/// Polls one service. Returns whether it stays registered. A panicking
/// service is dropped so the others keep running on this thread.
fn poll_service((name, service): &ServiceEntry) -> bool {
    match catch_unwind(AssertUnwindSafe(|| service.poll())) {
        Ok(done) => !done,
        Err(payload) => {
            tracing::error!(
                name = %name,
                panic = %panic_message(&*payload),
                "Polling service panicked, unregistering it"
            );
            false
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The service thread notices on its next round. Joining here could
        // deadlock since the last reference may be dropped on that thread.
        self.shutdown.store(true, Ordering::Release);
    }
}

/// Thread-backed host runtime. Clones share the same tasks and services.
#[derive(Clone)]
pub struct ThreadedHost {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ThreadedHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedHost")
            .field("caps", &self.inner.caps)
            .field("num_cpus", &self.inner.num_cpus)
            .field("tasks", &self.inner.tasks.len())
            .finish()
    }
}

impl Default for ThreadedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedHost {
    /// A host with every capability enabled.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ThreadedHostBuilder {
        ThreadedHostBuilder::new()
    }

    /// Runs `body` as a new task on its own thread.
    pub fn spawn_task<F>(&self, label: &str, body: F) -> TaskJoin
    where
        F: FnOnce() + Send + 'static,
    {
        let (task, events) = self.inner.new_task(label);

        let inner = self.inner.clone();
        let task_events = events.clone();
        let thread = std::thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                let _finish = ScopeGuard::new(|| {
                    CURRENT_TASK.with(|current| current.set(None));
                    inner.finish(task, &task_events);
                });

                CURRENT_TASK.with(|current| current.set(Some(task)));
                body();
            })
            .unwrap_or_else(|e| panic!("failed to spawn task {:?}: {}", label, e));

        TaskJoin {
            task,
            events,
            thread,
        }
    }

    /// Makes the calling thread act as a new task until the returned scope is
    /// dropped. Dropping the scope is the end of the task body.
    pub fn enter_task(&self, label: &str) -> TaskScope {
        let (task, events) = self.inner.new_task(label);
        let previous = CURRENT_TASK.with(|current| current.replace(Some(task)));

        TaskScope {
            task,
            previous,
            events,
            inner: self.inner.clone(),
        }
    }

    /// Current counter of `task`, or `None` once its dependencies were
    /// released.
    pub fn pending_events(&self, task: TaskHandle) -> Option<u64> {
        // Never lock a task's state while holding a map shard, release removes
        // the entry with the state locked.
        let events = self.inner.tasks.get(&task).map(|events| events.value().clone())?;
        let state = events.state.lock();

        if state.released { None } else { Some(state.pending) }
    }

    pub fn is_released(&self, task: TaskHandle) -> bool {
        !self.inner.tasks.contains_key(&task)
    }

    /// Waits until the dependencies of `task` are released. Returns false on
    /// timeout.
    pub fn wait_released(&self, task: TaskHandle, timeout: Duration) -> bool {
        let events = match self.inner.tasks.get(&task) {
            Some(events) => events.value().clone(),
            None => return true,
        };

        events.wait_released(Some(timeout))
    }

    /// Whether `notify_task_event_api` was called.
    pub fn was_notified(&self) -> bool {
        self.inner.notified.load(Ordering::Acquire)
    }

    pub fn num_services(&self) -> usize {
        self.inner.services.lock().len()
    }
}

impl HostRuntime for ThreadedHost {
    fn current_task(&self) -> Option<TaskHandle> {
        CURRENT_TASK
            .with(|current| current.get())
            .filter(|task| self.inner.tasks.contains_key(task))
    }

    fn increase_task_events(&self, task: TaskHandle, increment: u32) {
        let events = self.inner.events(task);
        let mut state = events.state.lock();

        assert!(
            !state.released,
            "increase on released task {} ({})",
            task, events.label
        );
        state.pending += u64::from(increment);
    }

    fn decrease_task_events(&self, task: TaskHandle, decrement: u32) {
        let events = self.inner.events(task);
        let mut state = events.state.lock();

        let Some(pending) = state.pending.checked_sub(u64::from(decrement)) else {
            panic!(
                "event counter underflow on task {} ({}): {} - {}",
                task, events.label, state.pending, decrement
            );
        };

        state.pending = pending;
        self.inner.maybe_release(task, &events, &mut state);
    }

    fn notify_task_event_api(&self) -> bool {
        if !self.inner.caps.contains(Capabilities::EVENT_API_NOTIFY) {
            return false;
        }

        self.inner.notified.store(true, Ordering::Release);
        true
    }

    fn polling_services(&self) -> Option<&dyn PollingServices> {
        if self.inner.caps.contains(Capabilities::POLLING_SERVICES) {
            Some(self)
        } else {
            None
        }
    }

    fn polling_tasks(&self) -> Option<&dyn PollingTasks> {
        if self.inner.caps.contains(Capabilities::POLLING_TASKS) {
            Some(self)
        } else {
            None
        }
    }

    fn cpu_topology(&self) -> Option<&dyn CpuTopology> {
        if self.inner.caps.contains(Capabilities::CPU_TOPOLOGY) {
            Some(self)
        } else {
            None
        }
    }
}

impl PollingServices for ThreadedHost {
    fn register_polling_service(&self, name: &str, service: Arc<dyn PollingService>) {
        self.inner
            .services
            .lock()
            .push((name.to_string(), service));

        self.inner.ensure_service_thread();
    }

    fn unregister_polling_service(&self, name: &str, service: &Arc<dyn PollingService>) {
        let mut services = self.inner.services.lock();

        let pos = services
            .iter()
            .position(|(n, s)| n == name && Arc::ptr_eq(s, service));

        match pos {
            Some(pos) => {
                services.remove(pos);
            }
            None => panic!("polling service {:?} is not registered", name),
        }
    }
}

impl PollingTasks for ThreadedHost {
    fn spawn_function(
        &self,
        label: &str,
        body: Box<dyn FnOnce() + Send>,
        on_completion: Box<dyn FnOnce() + Send>,
    ) {
        let res = std::thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                let res = catch_unwind(AssertUnwindSafe(body));
                on_completion();

                if let Err(payload) = res {
                    resume_unwind(payload);
                }
            });

        // Detached, like any host task.
        if let Err(e) = res {
            panic!("failed to spawn polling task {:?}: {}", label, e);
        }
    }

    fn wait_for(&self, micros: u64) -> u64 {
        let start = Instant::now();
        std::thread::sleep(Duration::from_micros(micros));
        start.elapsed().as_micros() as u64
    }
}

impl CpuTopology for ThreadedHost {
    fn num_cpus(&self) -> usize {
        self.inner.num_cpus
    }

    fn current_cpu(&self) -> usize {
        match OsCpuTopology.try_current_cpu() {
            Ok(cpu) => cpu % self.inner.num_cpus,
            Err(e) => panic!("failed to get current cpu: {}", e),
        }
    }
}

/// Handle to a task started with [`ThreadedHost::spawn_task`].
#[derive(Debug)]
pub struct TaskJoin {
    task: TaskHandle,

    events: Arc<TaskEvents>,

    thread: JoinHandle<()>,
}

impl TaskJoin {
    pub fn task(&self) -> TaskHandle {
        self.task
    }

    pub fn is_released(&self) -> bool {
        self.events.state.lock().released
    }

    /// Waits until the dependencies of the task are released or `timeout`
    /// elapsed. Returns whether they were released.
    pub fn wait_released(&self, timeout: Duration) -> bool {
        self.events.wait_released(Some(timeout))
    }

    /// Joins the task body, then blocks until its dependencies are released.
    /// A panic in the body is propagated.
    pub fn wait(self) {
        if let Err(payload) = self.thread.join() {
            resume_unwind(payload);
        }

        self.events.wait_released(None);
    }
}

/// The calling thread acts as a task while this is alive. See
/// [`ThreadedHost::enter_task`].
#[derive(Debug)]
pub struct TaskScope {
    task: TaskHandle,

    previous: Option<TaskHandle>,

    events: Arc<TaskEvents>,

    inner: Arc<Inner>,
}

impl TaskScope {
    pub fn task(&self) -> TaskHandle {
        self.task
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| current.set(self.previous));
        self.inner.finish(self.task, &self.events);
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("caps", &self.caps)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ThreadedHostBuilder {
    caps: Capabilities,

    num_cpus: Option<usize>,

    service_interval: Duration,
}

impl Default for ThreadedHostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedHostBuilder {
    pub fn new() -> Self {
        Self {
            caps: Capabilities::all(),
            num_cpus: None,
            service_interval: SERVICE_INTERVAL,
        }
    }

    pub fn polling_services(mut self, enabled: bool) -> Self {
        self.caps.set(Capabilities::POLLING_SERVICES, enabled);
        self
    }

    pub fn polling_tasks(mut self, enabled: bool) -> Self {
        self.caps.set(Capabilities::POLLING_TASKS, enabled);
        self
    }

    pub fn cpu_topology(mut self, enabled: bool) -> Self {
        self.caps.set(Capabilities::CPU_TOPOLOGY, enabled);
        self
    }

    pub fn event_api_notify(mut self, enabled: bool) -> Self {
        self.caps.set(Capabilities::EVENT_API_NOTIFY, enabled);
        self
    }

    #[track_caller]
    pub fn num_cpus(mut self, val: usize) -> Self {
        assert!(val > 0, "num_cpus must be greater than 0");
        self.num_cpus = Some(val);
        self
    }

    #[track_caller]
    pub fn service_interval(mut self, val: Duration) -> Self {
        assert!(!val.is_zero(), "service_interval must be greater than 0");
        self.service_interval = val;
        self
    }

    pub fn build(self) -> ThreadedHost {
        let num_cpus = self
            .num_cpus
            .unwrap_or_else(|| OsCpuTopology.try_num_cpus().map_or(1, |n| n.max(1)));

        ThreadedHost {
            inner: Arc::new(Inner {
                caps: self.caps,
                num_cpus,
                tasks: DashMap::new(),
                services: Mutex::new(Vec::new()),
                service_thread: Mutex::new(None),
                service_interval: self.service_interval,
                notified: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }
}
