use crate::error::{constants, ProtocolError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type Action<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Cross-thread FIFO of actions executed on one consumer.
///
/// Network tasks enqueue closures; the owner of the session state drains
/// them once per tick. A drain swaps the whole queue out under the lock and
/// runs the actions after releasing it, so producers never wait on handler
/// code and actions enqueued during a drain run on the next one.
pub struct Dispatcher<C> {
    queue: Mutex<Vec<Action<C>>>,
    pending: AtomicBool,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
        }
    }

    pub fn enqueue<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_LOCK.to_string()))?;
        queue.push(Box::new(action));
        self.pending.store(true, Ordering::Release);
        Ok(())
    }

    /// Run every queued action in enqueue order. Returns how many ran.
    pub fn drain(&self, consumer: &mut C) -> Result<usize> {
        if !self.pending.load(Ordering::Acquire) {
            return Ok(0);
        }

        let batch = {
            let mut queue = self
                .queue
                .lock()
                .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_LOCK.to_string()))?;
            self.pending.store(false, Ordering::Release);
            std::mem::take(&mut *queue)
        };

        let count = batch.len();
        for action in batch {
            action(consumer);
        }
        Ok(count)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
