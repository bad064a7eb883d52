use crate::errors::Error;
use crate::tasking::TaskingModel;
use std::sync::Arc;

/// Creates the device queues handed out by a [`QueuePool`].
pub trait QueueProvider {
    type Queue: Clone;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a queue with its own device context.
    fn create_queue(&self) -> Result<Self::Queue, Self::Error>;

    /// Creates a queue sharing the device context of `first`.
    fn create_queue_in_context(&self, first: &Self::Queue) -> Result<Self::Queue, Self::Error>;
}

/// How many queues to create.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueueCount {
    /// One queue per CPU known to the host runtime.
    #[default]
    Auto,
    Exact(usize),
}

/// Which queue to pick from the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    /// The queue affine to the CPU the caller is running on.
    #[default]
    Default,
    Index(usize),
}

/// Fixed set of device queues created up front and shared by all tasks.
///
/// Tasks running on the same CPU get the same queue with [`QueueId::Default`],
/// which keeps submissions from one worker ordered on one queue.
#[derive(Debug)]
pub struct QueuePool<Q> {
    queues: Vec<Q>,

    tasking: Arc<TaskingModel>,
}

impl<Q: Clone> QueuePool<Q> {
    pub fn try_new<P>(
        provider: &P,
        count: QueueCount,
        share_context: bool,
        tasking: Arc<TaskingModel>,
    ) -> Result<Self, Error>
    where
        P: QueueProvider<Queue = Q>,
    {
        let count = match count {
            QueueCount::Auto => tasking.num_cpus(),
            QueueCount::Exact(n) => n,
        };

        if count == 0 {
            return Err(Error::EmptyQueuePool);
        }

        let mut queues = Vec::with_capacity(count);
        let first = provider.create_queue().map_err(provider_error)?;
        queues.push(first);

        for _ in 1..count {
            let queue = if share_context {
                provider.create_queue_in_context(&queues[0])
            } else {
                provider.create_queue()
            };

            queues.push(queue.map_err(provider_error)?);
        }

        tracing::debug!(count, share_context, "Created queue pool");

        Ok(Self { queues, tasking })
    }

    pub fn get(&self, id: QueueId) -> Result<Q, Error> {
        let idx = match id {
            QueueId::Default => self.tasking.current_cpu() % self.queues.len(),
            QueueId::Index(idx) => idx,
        };

        self.queues
            .get(idx)
            .cloned()
            .ok_or(Error::InvalidQueueId {
                id: idx,
                len: self.queues.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

fn provider_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
    Error::QueueProvider(anyhow::Error::new(err))
}
