use crossbeam_queue::ArrayQueue;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;

/// Bounded multi-producer channel feeding the single polling consumer.
///
/// Producers serialize on a lock so a batch lands contiguously. When the
/// channel is full a producer keeps the lock and backs off until the consumer
/// made room, it never drops an item.
#[derive(Debug)]
pub(crate) struct IngestionQueue<T> {
    slots: ArrayQueue<T>,

    producers: Mutex<()>,
}

impl<T> IngestionQueue<T> {
    #[track_caller]
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ingestion capacity must be greater than 0");

        Self {
            slots: ArrayQueue::new(capacity),
            producers: Mutex::new(()),
        }
    }

    pub(crate) fn push(&self, item: T) {
        let _guard = self.producers.lock();
        self.push_locked(item);
    }

    /// Pushes every item of `items` with no item of another producer in
    /// between.
    pub(crate) fn push_batch<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let _guard = self.producers.lock();
        for item in items {
            self.push_locked(item);
        }
    }

    fn push_locked(&self, mut item: T) {
        let backoff = Backoff::new();

        loop {
            match self.slots.push(item) {
                Ok(()) => return,
                Err(rejected) => {
                    item = rejected;
                    backoff.snooze();
                }
            }
        }
    }

    /// Hands every item present when the drain started to `f`, oldest first.
    /// Items pushed concurrently are left for the next drain. Returns the
    /// number of items drained.
    pub(crate) fn drain<F>(&self, mut f: F) -> usize
    where
        F: FnMut(T),
    {
        let available = self.slots.len();
        let mut drained = 0;

        while drained < available {
            let Some(item) = self.slots.pop() else {
                break;
            };

            f(item);
            drained += 1;
        }

        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
