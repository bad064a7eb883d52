use crate::config::{Builder, Config};
use crate::device::{CompletionHandle, QueueCount, QueuePool, QueueProvider};
use crate::errors::Error;
use crate::host::HostRuntime;
use crate::requests::{Request, RequestTracker, TickStats};
use crate::tasking::{PollingHandle, TaskingModel};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Everything needed to let tasks wait on device operations without
/// blocking.
///
/// Creating an environment starts a polling instance that periodically
/// checks pending requests. Several environments may coexist, each with its
/// own polling instance and pending requests.
pub struct Environment<H: CompletionHandle> {
    cfg: Config,

    tasking: Arc<TaskingModel>,

    tracker: Arc<RequestTracker<H>>,

    /// Taken by `finalize`.
    polling: Mutex<Option<PollingHandle>>,
}

impl<H: CompletionHandle> Environment<H> {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn try_new(cfg: Config, host: Arc<dyn HostRuntime>) -> Result<Self, Error> {
        let tasking = Arc::new(TaskingModel::try_new(host, &cfg)?);
        let tracker = Arc::new(RequestTracker::new(tasking.clone(), &cfg));

        let polling = {
            let tracker = tracker.clone();
            tasking
                .polling()
                .register(&cfg.polling_name, cfg.polling_frequency_us, move || {
                    // Only contended by `poll_requests`, which covers this tick.
                    tracker.try_drain_and_check();
                })
        };

        tracing::info!(
            name = %cfg.polling_name,
            backend = ?tasking.backend(),
            frequency_us = cfg.polling_frequency_us,
            capabilities = ?tasking.capabilities(),
            "Initialized task-aware environment"
        );

        Ok(Self {
            cfg,
            tasking,
            tracker,
            polling: Mutex::new(Some(polling)),
        })
    }

    /// Makes the current task wait on `handle` without blocking it: its
    /// dependencies are released only once the device operation completed.
    pub fn synchronize_event_async(&self, handle: H) {
        self.tracker.submit(handle, true);
    }

    /// Wraps `handle` in a request that is not bound to any task yet.
    pub fn generate_request(&self, handle: H) -> Request<H> {
        match self.tracker.submit(handle, false) {
            Some(request) => request,
            None => unreachable!("unbound submission always returns the request"),
        }
    }

    /// Binds the request in `slot` to the current task. An empty slot is a
    /// no-op. The slot is empty when this returns.
    pub fn wait_request_async(&self, slot: &mut Option<Request<H>>) {
        if let Some(request) = slot.take() {
            self.tracker.attach(request);
        }
    }

    /// Binds every request of `slots` to the current task with a single
    /// counter update. Empty slots are skipped. Every slot is empty when this
    /// returns.
    pub fn waitall_requests_async(&self, slots: &mut [Option<Request<H>>]) {
        self.tracker.attach_batch(slots);
    }

    /// Creates a pool of device queues sized after the host's CPUs, or
    /// `count`.
    pub fn create_queues<P>(
        &self,
        provider: &P,
        count: QueueCount,
        share_context: bool,
    ) -> Result<QueuePool<P::Queue>, Error>
    where
        P: QueueProvider,
    {
        QueuePool::try_new(provider, count, share_context, self.tasking.clone())
    }

    /// Runs one polling tick on the calling thread, after any tick of the
    /// polling instance in progress.
    pub fn poll_requests(&self) -> TickStats {
        self.tracker.drain_and_check_blocking()
    }

    /// Requests pending as of the last polling tick.
    pub fn pending_requests(&self) -> usize {
        self.tracker.pending_len()
    }

    pub fn released_requests(&self) -> u64 {
        self.tracker.released_total()
    }

    pub fn tasking(&self) -> &Arc<TaskingModel> {
        &self.tasking
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Stops polling. Requests still pending are dropped and their owners
    /// are never released.
    pub fn finalize(self) -> Result<(), Error> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<(), Error> {
        let Some(polling) = self.polling.lock().take() else {
            return Ok(());
        };

        self.tasking.polling().unregister(polling)?;

        let abandoned = self.tracker.abandon_all();
        if abandoned > 0 {
            tracing::warn!(
                name = %self.cfg.polling_name,
                abandoned,
                "Finalized with pending requests, their tasks will never be released"
            );
        }

        tracing::debug!(name = %self.cfg.polling_name, "Finalized task-aware environment");
        Ok(())
    }
}

impl<H: CompletionHandle> Drop for Environment<H> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(?e, "Failed to finalize task-aware environment");
        }
    }
}

impl<H: CompletionHandle> fmt::Debug for Environment<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("cfg", &self.cfg)
            .field("tasking", &self.tasking)
            .field("tracker", &self.tracker)
            .finish()
    }
}
