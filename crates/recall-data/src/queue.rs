//! A bounded FIFO handoff queue for the staged pipeline.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;

/// Returned when an operation hits a closed (or abandoned) queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("queue closed")]
pub struct QueueClosed;

#[derive(Debug)]
struct QueueInner<T> {
    buf: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A bounded multi-producer multi-consumer FIFO queue.
///
/// `push` blocks while the queue is full, `pop` blocks while it is
/// empty. After [`BoundedQueue::close`], pushes fail immediately and
/// pops drain whatever is left before failing. Clones share the same
/// queue.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    inner: Arc<(Mutex<QueueInner<T>>, Condvar, Condvar)>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        let inner = QueueInner {
            buf: VecDeque::new(),
            capacity: capacity.max(1),
            closed: false,
        };
        Self {
            inner: Arc::new((Mutex::new(inner), Condvar::new(), Condvar::new())),
        }
    }

    /// Blocks until there is room, then enqueues `item`.
    pub fn push(&self, item: T) -> Result<(), QueueClosed> {
        let (lock, not_empty, not_full) = &*self.inner;
        let mut state = lock.lock().map_err(|_| QueueClosed)?;
        while !state.closed && state.buf.len() >= state.capacity {
            state = not_full.wait(state).map_err(|_| QueueClosed)?;
        }
        if state.closed {
            return Err(QueueClosed);
        }
        state.buf.push_back(item);
        not_empty.notify_one();
        Ok(())
    }

    /// Blocks until an item is available, then dequeues it. A closed
    /// queue keeps yielding until its buffer is drained.
    pub fn pop(&self) -> Result<T, QueueClosed> {
        let (lock, not_empty, not_full) = &*self.inner;
        let mut state = lock.lock().map_err(|_| QueueClosed)?;
        while !state.closed && state.buf.is_empty() {
            state = not_empty.wait(state).map_err(|_| QueueClosed)?;
        }
        match state.buf.pop_front() {
            Some(item) => {
                not_full.notify_one();
                Ok(item)
            }
            None => Err(QueueClosed),
        }
    }

    /// Dequeues without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let (lock, _, not_full) = &*self.inner;
        let mut state = lock.lock().ok()?;
        let item = state.buf.pop_front();
        if item.is_some() {
            not_full.notify_one();
        }
        item
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        let (lock, _, _) = &*self.inner;
        let state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.buf.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue and wakes every waiter.
    pub fn close(&self) {
        let (lock, not_empty, not_full) = &*self.inner;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        not_empty.notify_all();
        not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_within_capacity() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        for i in 0..4 {
            assert_eq!(queue.pop(), Ok(i));
        }
    }

    #[test]
    fn push_blocks_until_a_slot_frees() {
        let queue = BoundedQueue::new(1);
        queue.push(1).unwrap();

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push(2))
        };
        // Give the producer time to block on the full queue.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.pop(), Ok(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop(), Ok(2));
    }

    #[test]
    fn pop_blocks_until_an_item_arrives() {
        let queue = BoundedQueue::new(2);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.push(7).unwrap();
        assert_eq!(consumer.join().unwrap(), Ok(7));
    }

    #[test]
    fn close_drains_then_fails() {
        let queue = BoundedQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.close();

        assert_eq!(queue.push(3), Err(QueueClosed));
        assert_eq!(queue.pop(), Ok(1));
        assert_eq!(queue.pop(), Ok(2));
        assert_eq!(queue.pop(), Err(QueueClosed));
    }

    #[test]
    fn close_wakes_blocked_consumers() {
        let queue: BoundedQueue<i32> = BoundedQueue::new(1);
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(consumer.join().unwrap(), Err(QueueClosed));
    }

    #[test]
    fn try_pop_never_blocks() {
        let queue = BoundedQueue::new(1);
        assert_eq!(queue.try_pop(), None);
        queue.push(5).unwrap();
        assert_eq!(queue.try_pop(), Some(5));
    }
}
