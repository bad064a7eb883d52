//! Request lifecycle tracking.
//!
//! A [`Request`] pairs a device completion handle with the task that waits on
//! it. Its membership is carried by ownership: the caller owns an unbound
//! request, binding moves it into the ingestion channel, the polling tick
//! moves it into the pending slab, and completion drops it. A request can
//! therefore never be in two places, and never be released twice.

use crate::config::Config;
use crate::device::{CompletionHandle, CompletionStatus};
use crate::errors::{FatalPolicy, FatalReason, fatal};
use crate::host::TaskHandle;
use crate::tasking::TaskingModel;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

mod queue;
use queue::IngestionQueue;

/// Requests staged on the stack by `attach_batch` before spilling to the heap.
const BATCH_INLINE: usize = 16;

/// Requests kept in the pending slab before it has to grow.
const PENDING_CAPACITY: usize = 1024;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier, increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A device operation a task is waiting on.
#[derive(Debug)]
pub struct Request<H> {
    id: RequestId,

    handle: H,

    /// Set once, right before the request is handed to the tracker.
    owner: Option<TaskHandle>,
}

impl<H> Request<H> {
    fn new(handle: H) -> Self {
        Self {
            id: RequestId::next(),
            handle,
            owner: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn owner(&self) -> Option<TaskHandle> {
        self.owner
    }
}

/// Outcome of one [`RequestTracker::drain_and_check`] tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    /// Requests moved from the ingestion channel into the pending slab.
    pub drained: usize,

    /// Completed requests whose owner was released.
    pub released: usize,

    /// Requests still pending after the tick.
    pub pending: usize,
}

/// Forwards device completions to the owners' pending-event counters.
///
/// Any number of tasks may bind requests concurrently. Exactly one polling
/// context calls [`RequestTracker::drain_and_check`] at a time.
pub struct RequestTracker<H> {
    tasking: Arc<TaskingModel>,

    queue: IngestionQueue<Option<Request<H>>>,

    /// Owned by the polling context. Never locked by producers.
    pending: Mutex<Slab<Request<H>>>,

    /// Mirror of the pending slab length, readable without the lock.
    num_pending: AtomicUsize,

    released: AtomicU64,

    unreported_is_pending: bool,

    policy: FatalPolicy,
}

impl<H: CompletionHandle> RequestTracker<H> {
    pub fn new(tasking: Arc<TaskingModel>, cfg: &Config) -> Self {
        Self {
            tasking,
            queue: IngestionQueue::new(cfg.ingestion_capacity),
            pending: Mutex::new(Slab::with_capacity(PENDING_CAPACITY)),
            num_pending: AtomicUsize::new(0),
            released: AtomicU64::new(0),
            unreported_is_pending: cfg.unreported_is_pending,
            policy: cfg.on_fatal,
        }
    }

    /// Creates a request for `handle`.
    ///
    /// With `bind` the request is bound to the current task right away and
    /// `None` is returned, the tracker owns it from now on. Without `bind`
    /// the unbound request is returned and must later go through
    /// [`attach`](Self::attach) or [`attach_batch`](Self::attach_batch).
    pub fn submit(&self, handle: H, bind: bool) -> Option<Request<H>> {
        let request = Request::new(handle);
        if !bind {
            return Some(request);
        }

        self.attach(request);
        None
    }

    /// Binds `request` to the current task and hands it to the polling
    /// context. The task's dependencies stay locked until the device
    /// operation completes.
    pub fn attach(&self, mut request: Request<H>) {
        debug_assert!(request.owner.is_none(), "{} already bound", request.id);

        let task = self.tasking.current_task();
        request.owner = Some(task);

        // Must happen before the request is visible to the polling context,
        // otherwise the decrement could overtake it.
        self.tasking.increase_task_events(task, 1);
        self.queue.push(Some(request));
    }

    /// Binds every request of `requests` to the current task at once.
    ///
    /// `None` slots are skipped for counting but still travel through the
    /// channel, where the polling context discards them. The counter is
    /// increased once by the number of actual requests. Every slot is `None`
    /// when this returns.
    pub fn attach_batch(&self, requests: &mut [Option<Request<H>>]) {
        if requests.is_empty() {
            return;
        }

        let bound = requests.iter().filter(|slot| slot.is_some()).count();
        let owner = if bound > 0 {
            Some(self.tasking.current_task())
        } else {
            None
        };

        let batch = requests
            .iter_mut()
            .map(|slot| {
                let mut request = slot.take();
                if let Some(request) = request.as_mut() {
                    debug_assert!(request.owner.is_none(), "{} already bound", request.id);
                    request.owner = owner;
                }
                request
            })
            .collect::<SmallVec<[_; BATCH_INLINE]>>();

        if let Some(task) = owner {
            let increment = match u32::try_from(bound) {
                Ok(increment) => increment,
                Err(_) => fatal(
                    self.policy,
                    FatalReason::HostCallFailed,
                    format!("batch of {} requests overflows the event counter", bound),
                ),
            };

            self.tasking.increase_task_events(task, increment);
        }

        self.queue.push_batch(batch);
    }

    /// Moves newly bound requests into the pending slab, then releases the
    /// owner of every request whose device operation completed.
    ///
    /// Each pending request is queried exactly once per call. Calling this
    /// from two polling contexts at once is fatal.
    pub fn drain_and_check(&self) -> TickStats {
        let Some(mut pending) = self.pending.try_lock() else {
            fatal(
                self.policy,
                FatalReason::ConcurrentDrain,
                "pending requests are already being checked by another polling context"
                    .to_string(),
            );
        };

        self.check(&mut pending)
    }

    /// Same as [`drain_and_check`](Self::drain_and_check), but skips the tick
    /// if another one is in progress.
    pub fn try_drain_and_check(&self) -> Option<TickStats> {
        let mut pending = self.pending.try_lock()?;
        Some(self.check(&mut pending))
    }

    /// Same as [`drain_and_check`](Self::drain_and_check), but waits for a
    /// tick running elsewhere to finish instead of failing.
    pub fn drain_and_check_blocking(&self) -> TickStats {
        let mut pending = self.pending.lock();
        self.check(&mut pending)
    }

    fn check(&self, pending: &mut Slab<Request<H>>) -> TickStats {
        let drained = self.queue.drain(|slot| {
            if let Some(request) = slot {
                pending.insert(request);
            }
        });

        let mut released = 0;
        pending.retain(|_, request| match request.handle.status() {
            CompletionStatus::Complete => {
                if let Some(owner) = request.owner {
                    self.tasking.decrease_task_events(owner, 1);
                }

                released += 1;
                false
            }
            CompletionStatus::Submitted | CompletionStatus::Running => true,
            CompletionStatus::Unreported if self.unreported_is_pending => true,
            status => fatal(
                self.policy,
                FatalReason::InvalidCompletionStatus,
                format!(
                    "{} reported invalid completion status {}",
                    request.id, status
                ),
            ),
        });

        let stats = TickStats {
            drained,
            released,
            pending: pending.len(),
        };

        self.num_pending.store(stats.pending, Ordering::Release);
        self.released.fetch_add(released as u64, Ordering::Relaxed);

        tracing::trace!(
            drained = stats.drained,
            released = stats.released,
            pending = stats.pending,
            "Checked pending requests"
        );

        stats
    }

    /// Drops every request still tracked without releasing its owner. Returns
    /// how many were dropped.
    pub(crate) fn abandon_all(&self) -> usize {
        let mut pending = self.pending.lock();

        let mut abandoned = pending.len();
        self.queue.drain(|slot| {
            if slot.is_some() {
                abandoned += 1;
            }
        });

        pending.clear();
        self.num_pending.store(0, Ordering::Release);

        abandoned
    }
}

impl<H> RequestTracker<H> {
    /// Requests in the pending slab as of the last tick.
    pub fn pending_len(&self) -> usize {
        self.num_pending.load(Ordering::Acquire)
    }

    /// Slots waiting in the ingestion channel, null placeholders included.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Requests released since creation.
    pub fn released_total(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl<H> fmt::Debug for RequestTracker<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracker")
            .field("queued", &self.queue.len())
            .field("pending", &self.pending_len())
            .field("released", &self.released_total())
            .field("unreported_is_pending", &self.unreported_is_pending)
            .finish()
    }
}
