use crate::config::{Builder, Config};
use crate::device::{CompletionHandle, CompletionStatus, ManualEvent};
use crate::errors::FatalPolicy;
use crate::host::{
    Capabilities, CpuTopology, HostRuntime, PollingService, PollingServices, PollingTasks,
    TaskHandle, ThreadedHost,
};
use crate::tasking::TaskingModel;
use crate::test_utils::{Call, Tracker};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// Host runtime recording every call it receives.
///
/// Polling services and polling tasks are delegated to a [`ThreadedHost`] so
/// both backends really run. Event counters are plain signed integers with
/// no release semantics, which lets tests observe them at any time.
#[derive(Debug)]
pub(crate) struct MockHost {
    threaded: ThreadedHost,

    caps: Capabilities,

    num_cpus: usize,

    current_cpu: AtomicUsize,

    event_api_notify: bool,

    next_task: AtomicU64,

    counters: DashMap<TaskHandle, AtomicI64>,

    current: DashMap<ThreadId, TaskHandle>,

    tracker: Tracker,
}

impl MockHost {
    pub(crate) fn builder() -> MockHostBuilder {
        MockHostBuilder::new()
    }

    pub(crate) fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Makes the calling thread run inside a fresh task.
    pub(crate) fn enter_task(&self) -> TaskHandle {
        let raw = self.next_task.fetch_add(1, Ordering::Relaxed);
        let task = TaskHandle::from_raw(raw).expect("task ids start at 1");

        self.counters.insert(task, AtomicI64::new(0));
        self.current.insert(thread::current().id(), task);
        task
    }

    pub(crate) fn leave_task(&self) {
        self.current.remove(&thread::current().id());
    }

    pub(crate) fn pending_events(&self, task: TaskHandle) -> i64 {
        self.counters
            .get(&task)
            .map_or(0, |counter| counter.load(Ordering::SeqCst))
    }

    pub(crate) fn set_current_cpu(&self, cpu: usize) {
        self.current_cpu.store(cpu, Ordering::SeqCst);
    }

    pub(crate) fn num_services(&self) -> usize {
        self.threaded.num_services()
    }

    fn add_events(&self, task: TaskHandle, delta: i64) {
        self.counters
            .entry(task)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::SeqCst);
    }
}

impl HostRuntime for MockHost {
    fn current_task(&self) -> Option<TaskHandle> {
        self.current
            .get(&thread::current().id())
            .map(|task| *task.value())
    }

    fn increase_task_events(&self, task: TaskHandle, increment: u32) {
        self.tracker.record(Call::IncreaseEvents { task, n: increment });
        self.add_events(task, i64::from(increment));
    }

    fn decrease_task_events(&self, task: TaskHandle, decrement: u32) {
        self.tracker.record(Call::DecreaseEvents { task, n: decrement });
        self.add_events(task, -i64::from(decrement));
    }

    fn notify_task_event_api(&self) -> bool {
        self.tracker.record(Call::Notify);
        self.event_api_notify
    }

    fn polling_services(&self) -> Option<&dyn PollingServices> {
        if self.caps.contains(Capabilities::POLLING_SERVICES) {
            Some(self)
        } else {
            None
        }
    }

    fn polling_tasks(&self) -> Option<&dyn PollingTasks> {
        if self.caps.contains(Capabilities::POLLING_TASKS) {
            Some(self)
        } else {
            None
        }
    }

    fn cpu_topology(&self) -> Option<&dyn CpuTopology> {
        if self.caps.contains(Capabilities::CPU_TOPOLOGY) {
            Some(self)
        } else {
            None
        }
    }
}

impl PollingServices for MockHost {
    fn register_polling_service(&self, name: &str, service: Arc<dyn PollingService>) {
        self.tracker.record(Call::RegisterService {
            name: name.to_string(),
        });
        self.threaded.register_polling_service(name, service);
    }

    fn unregister_polling_service(&self, name: &str, service: &Arc<dyn PollingService>) {
        self.tracker.record(Call::UnregisterService {
            name: name.to_string(),
        });
        self.threaded.unregister_polling_service(name, service);
    }
}

impl PollingTasks for MockHost {
    fn spawn_function(
        &self,
        label: &str,
        body: Box<dyn FnOnce() + Send>,
        on_completion: Box<dyn FnOnce() + Send>,
    ) {
        self.tracker.record(Call::SpawnFunction {
            label: label.to_string(),
        });
        self.threaded.spawn_function(label, body, on_completion);
    }

    fn wait_for(&self, micros: u64) -> u64 {
        self.tracker.record(Call::WaitFor { micros });
        self.threaded.wait_for(micros)
    }
}

impl CpuTopology for MockHost {
    fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    fn current_cpu(&self) -> usize {
        self.current_cpu.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockHostBuilder {
    caps: Capabilities,

    num_cpus: usize,

    current_cpu: usize,

    event_api_notify: bool,
}

impl MockHostBuilder {
    fn new() -> Self {
        Self {
            caps: Capabilities::POLLING_SERVICES | Capabilities::POLLING_TASKS,
            num_cpus: 1,
            current_cpu: 0,
            event_api_notify: false,
        }
    }

    pub(crate) fn polling_services(mut self, enabled: bool) -> Self {
        self.caps.set(Capabilities::POLLING_SERVICES, enabled);
        self
    }

    pub(crate) fn polling_tasks(mut self, enabled: bool) -> Self {
        self.caps.set(Capabilities::POLLING_TASKS, enabled);
        self
    }

    /// Exposes a CPU topology with `num_cpus` CPUs, the caller running on
    /// `current_cpu`.
    pub(crate) fn cpus(mut self, num_cpus: usize, current_cpu: usize) -> Self {
        self.caps.insert(Capabilities::CPU_TOPOLOGY);
        self.num_cpus = num_cpus;
        self.current_cpu = current_cpu;
        self
    }

    pub(crate) fn event_api_notify(mut self, enabled: bool) -> Self {
        self.event_api_notify = enabled;
        self
    }

    pub(crate) fn build(self) -> Arc<MockHost> {
        Arc::new(MockHost {
            threaded: ThreadedHost::new(),
            caps: self.caps,
            num_cpus: self.num_cpus,
            current_cpu: AtomicUsize::new(self.current_cpu),
            event_api_notify: self.event_api_notify,
            next_task: AtomicU64::new(1),
            counters: DashMap::new(),
            current: DashMap::new(),
            tracker: Tracker::new(),
        })
    }
}

/// Builds a tasking model with the default configuration on top of `host`,
/// except that fatal errors unwind so tests can catch them.
pub(crate) fn mock_tasking(host: Arc<MockHost>) -> (Arc<MockHost>, Arc<TaskingModel>) {
    let cfg = Config::try_from(Builder::new().on_fatal(FatalPolicy::Panic))
        .expect("default configuration is valid");
    let tasking = TaskingModel::try_new(host.clone(), &cfg)
        .expect("mock host supports the default polling backend");

    (host, Arc::new(tasking))
}

/// Completion handle driven by the test, counting how often its status was
/// queried.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockEvent {
    event: ManualEvent,

    queries: Arc<AtomicUsize>,
}

impl MockEvent {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_status(status: CompletionStatus) -> Self {
        Self {
            event: ManualEvent::with_status(status),
            queries: Arc::default(),
        }
    }

    pub(crate) fn complete_now() -> Self {
        Self::with_status(CompletionStatus::Complete)
    }

    pub(crate) fn complete(&self) {
        self.event.complete();
    }

    pub(crate) fn set_status(&self, status: CompletionStatus) {
        self.event.set_status(status);
    }

    pub(crate) fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl CompletionHandle for MockEvent {
    fn status(&self) -> CompletionStatus {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.event.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Method;

    #[test]
    fn test_mock_host_counters() {
        let host = MockHost::builder().build();
        assert!(host.current_task().is_none());

        let task = host.enter_task();
        assert_eq!(host.current_task(), Some(task));

        host.increase_task_events(task, 2);
        host.decrease_task_events(task, 1);
        assert_eq!(host.pending_events(task), 1);
        assert_eq!(host.tracker().num_calls(&Method::IncreaseEvents), 1);

        host.leave_task();
        assert!(host.current_task().is_none());
    }

    #[test]
    fn test_mock_event_counts_queries() {
        let event = MockEvent::new();
        let observer = event.clone();

        assert_eq!(observer.status(), CompletionStatus::Submitted);
        event.complete();
        assert!(observer.status().is_complete());
        assert_eq!(event.queries(), 2);
    }
}
