#![allow(unused)]

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use taskaware::{CompletionHandle, CompletionStatus, ManualEvent, QueueProvider};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `cond` until it holds, panicking after [`TIMEOUT`].
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_micros(100));
    }
}

/// A manual event counting how many times its status was queried.
#[derive(Debug, Clone, Default)]
pub struct CountingEvent {
    event: ManualEvent,

    queries: Arc<AtomicUsize>,
}

impl CountingEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        self.event.complete();
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl CompletionHandle for CountingEvent {
    fn status(&self) -> CompletionStatus {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.event.status()
    }
}

/// Device queue simulated on the host. Every submission yields an event the
/// test completes by hand.
#[derive(Debug, Clone)]
pub struct SimQueue {
    pub id: usize,

    pub context: usize,

    submitted: Arc<AtomicUsize>,
}

impl SimQueue {
    pub fn submit(&self) -> ManualEvent {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        ManualEvent::new()
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct SimDevice {
    created: AtomicUsize,
}

impl QueueProvider for SimDevice {
    type Queue = SimQueue;
    type Error = Infallible;

    fn create_queue(&self) -> Result<SimQueue, Infallible> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SimQueue {
            id,
            context: id,
            submitted: Arc::default(),
        })
    }

    fn create_queue_in_context(&self, first: &SimQueue) -> Result<SimQueue, Infallible> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SimQueue {
            id,
            context: first.context,
            submitted: Arc::default(),
        })
    }
}
