//! Bridge to the host runtime's task model.
//!
//! Everything the rest of the crate needs from the host goes through
//! [`TaskingModel`]: the current task, its pending-event counter, CPU
//! information and the polling driver. Capabilities are probed once here, so
//! later calls never have to deal with a missing one.

use crate::config::Config;
use crate::errors::{Error, FatalPolicy, FatalReason, fatal};
use crate::host::{Capabilities, HostRuntime, OsCpuTopology, TaskHandle};
use std::fmt;
use std::sync::Arc;

pub mod polling;
pub use polling::{PollingBackend, PollingDriver, PollingHandle, PollingState};

pub struct TaskingModel {
    host: Arc<dyn HostRuntime>,

    caps: Capabilities,

    polling: PollingDriver,

    /// Used only when the host has no CPU topology of its own.
    fallback: OsCpuTopology,

    policy: FatalPolicy,
}

impl TaskingModel {
    /// Probes `host` and picks the polling backend.
    ///
    /// If polling services were not requested but the host cannot spawn and
    /// pause polling tasks, polling services are used anyway.
    pub fn try_new(host: Arc<dyn HostRuntime>, cfg: &Config) -> Result<Self, Error> {
        let mut caps = Capabilities::probe(host.as_ref());

        let use_services = if !cfg.polling_services && !caps.contains(Capabilities::POLLING_TASKS)
        {
            tracing::warn!("Host runtime cannot spawn polling tasks, forcing polling services");
            true
        } else {
            cfg.polling_services
        };

        if use_services && !caps.contains(Capabilities::POLLING_SERVICES) {
            return Err(Error::MissingCapability {
                capability: "register_polling_service",
            });
        }

        let backend = if use_services {
            PollingBackend::Services
        } else {
            PollingBackend::Tasks
        };

        if host.notify_task_event_api() {
            caps |= Capabilities::EVENT_API_NOTIFY;
        }

        Ok(Self {
            polling: PollingDriver::new(host.clone(), backend, cfg.on_fatal),
            host,
            caps,
            fallback: OsCpuTopology,
            policy: cfg.on_fatal,
        })
    }

    /// The task running on the calling thread. Calling this outside of a task
    /// is fatal.
    pub fn current_task(&self) -> TaskHandle {
        match self.host.current_task() {
            Some(task) => task,
            None => fatal(
                self.policy,
                FatalReason::NoCurrentTask,
                "no current task: requests must be bound from inside a task".to_string(),
            ),
        }
    }

    pub fn increase_task_events(&self, task: TaskHandle, increment: u32) {
        self.host.increase_task_events(task, increment);
    }

    pub fn decrease_task_events(&self, task: TaskHandle, decrement: u32) {
        self.host.decrease_task_events(task, decrement);
    }

    pub fn num_cpus(&self) -> usize {
        if let Some(topology) = self.host.cpu_topology() {
            return topology.num_cpus();
        }

        match self.fallback.try_num_cpus() {
            Ok(num_cpus) => num_cpus,
            Err(e) => fatal(
                self.policy,
                FatalReason::HostCallFailed,
                format!("failed to get the number of cpus: {}", e),
            ),
        }
    }

    pub fn current_cpu(&self) -> usize {
        if let Some(topology) = self.host.cpu_topology() {
            return topology.current_cpu();
        }

        match self.fallback.try_current_cpu() {
            Ok(cpu) => cpu,
            Err(e) => fatal(
                self.policy,
                FatalReason::HostCallFailed,
                format!("failed to get the current cpu: {}", e),
            ),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn backend(&self) -> PollingBackend {
        self.polling.backend()
    }

    pub fn polling(&self) -> &PollingDriver {
        &self.polling
    }

    pub fn host(&self) -> &Arc<dyn HostRuntime> {
        &self.host
    }

    pub fn fatal_policy(&self) -> FatalPolicy {
        self.policy
    }
}

impl fmt::Debug for TaskingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskingModel")
            .field("caps", &self.caps)
            .field("backend", &self.polling.backend())
            .field("policy", &self.policy)
            .finish()
    }
}
