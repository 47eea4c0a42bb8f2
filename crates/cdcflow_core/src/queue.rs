//! Bounded blocking FIFO between the capture bridge and the workers.
//!
//! The queue never grows past its capacity: a full queue makes producers
//! wait (or fail after a timeout), which is how backpressure reaches the
//! capture source. Closing the queue wakes everyone; consumers drain what is
//! left, producers are refused.

use crate::event::ChangeEvent;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// An event waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// The queued event.
    pub event: ChangeEvent,
    /// When the entry was enqueued.
    pub enqueued_at: Instant,
}

impl QueueEntry {
    /// Wraps `event`, stamped now.
    pub fn new(event: ChangeEvent) -> Self {
        Self {
            event,
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent in the queue so far.
    #[must_use]
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Why an item was not enqueued. The item is handed back.
pub enum EnqueueError<T> {
    /// No space became available in time.
    Full(T),
    /// The queue was closed.
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    /// Returns true if the queue was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer FIFO.
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once [`BoundedQueue::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns true if the queue is closed and empty.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }

    /// Enqueues without waiting.
    ///
    /// # Errors
    ///
    /// Returns the item if the queue is full or closed.
    pub fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EnqueueError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(EnqueueError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues, waiting as long as needed for space.
    ///
    /// # Errors
    ///
    /// Returns the item if the queue is closed.
    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        let mut state = self.state.lock();
        while !state.closed && state.items.len() >= self.capacity {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(EnqueueError::Closed(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues, waiting at most `timeout` for space.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] on timeout and [`EnqueueError::Closed`]
    /// if the queue is closed. Either way the item comes back.
    pub fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), EnqueueError<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.closed && state.items.len() >= self.capacity {
            if self.not_full.wait_until(&mut state, deadline).timed_out()
                && state.items.len() >= self.capacity
                && !state.closed
            {
                return Err(EnqueueError::Full(item));
            }
        }
        if state.closed {
            return Err(EnqueueError::Closed(item));
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeues, waiting for an item. Returns `None` once the queue is
    /// closed and drained.
    pub fn dequeue(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Dequeues, waiting at most `timeout`. `None` means timeout or a
    /// drained queue; see [`BoundedQueue::is_drained`].
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                let item = state.items.pop_front();
                if item.is_some() {
                    drop(state);
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    /// Stops accepting items and wakes all waiters. Idempotent.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Removes and returns everything still queued.
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.state.lock().items.drain(..).collect();
        self.not_full.notify_all();
        items
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.try_enqueue(i).unwrap();
        }
        assert_eq!(queue.len(), 4);
        for i in 0..4 {
            assert_eq!(queue.dequeue(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = BoundedQueue::<u8>::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = BoundedQueue::new(1);
        queue.try_enqueue(1).unwrap();
        let err = queue.try_enqueue(2).unwrap_err();
        assert!(!err.is_closed());
        assert_eq!(err.into_inner(), 2);
    }

    #[test]
    fn enqueue_timeout_returns_item() {
        let queue = BoundedQueue::new(1);
        queue.try_enqueue("a").unwrap();
        let started = Instant::now();
        let err = queue
            .enqueue_timeout("b", Duration::from_millis(30))
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(matches!(err, EnqueueError::Full("b")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn blocked_producer_resumes_when_consumer_takes() {
        let queue = Arc::new(BoundedQueue::new(2));
        queue.try_enqueue(1).unwrap();
        queue.try_enqueue(2).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue_timeout(3, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue(), Some(1));

        assert!(producer.join().unwrap().is_ok());
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), Some(3));
    }

    #[test]
    fn close_wakes_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.try_enqueue(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.enqueue(2))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();

        let err = producer.join().unwrap().unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn close_drains_then_ends() {
        let queue = BoundedQueue::new(4);
        queue.try_enqueue(1).unwrap();
        queue.close();
        assert!(queue.try_enqueue(2).unwrap_err().is_closed());
        assert!(!queue.is_drained());
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_drained());
    }

    #[test]
    fn dequeue_timeout_on_empty() {
        let queue = BoundedQueue::<u32>::new(1);
        assert_eq!(queue.dequeue_timeout(Duration::from_millis(10)), None);
        assert!(!queue.is_drained());
    }

    #[test]
    fn drain_returns_leftovers() {
        let queue = BoundedQueue::new(3);
        queue.try_enqueue(1).unwrap();
        queue.try_enqueue(2).unwrap();
        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..16, ops in prop::collection::vec(any::<bool>(), 0..200)) {
            let queue = BoundedQueue::new(capacity);
            let mut model = VecDeque::new();
            for (i, push) in ops.into_iter().enumerate() {
                if push {
                    let accepted = queue.try_enqueue(i).is_ok();
                    prop_assert_eq!(accepted, model.len() < capacity);
                    if accepted {
                        model.push_back(i);
                    }
                } else {
                    prop_assert_eq!(queue.dequeue_timeout(Duration::ZERO), model.pop_front());
                }
                prop_assert!(queue.len() <= capacity);
            }
        }
    }
}
