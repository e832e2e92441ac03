//! Bounded multi-producer queues connecting producers, workers and the sender.
//!
//! Every hand-off in the daemon goes through a [`BoundedQueue`]: decoded
//! signals into the inspection worker, assembled payloads out to the sender,
//! fetch-request ids into the fetch worker. A full queue drops the element
//! and reports `false` so producers never block on a slow consumer; drops are
//! counted and logged. Consumers park on a [`WakeSignal`] and are woken by
//! queue listeners.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::warn;

type Listener = Box<dyn Fn() + Send + Sync>;

/// Thread-safe bounded FIFO. `push` on a full queue discards the element.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    max_size: usize,
    name: String,
    /// Listeners fire only when the queue length is a multiple of this, so a
    /// busy queue does not wake its consumer on every element.
    notify_every: usize,
    listeners: Mutex<Vec<Listener>>,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(max_size: usize, name: impl Into<String>) -> Self {
        Self::with_notify_every(max_size, name, 1)
    }

    pub fn with_notify_every(max_size: usize, name: impl Into<String>, notify_every: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            max_size,
            name: name.into(),
            notify_every: notify_every.max(1),
            listeners: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an element. Returns false and discards the element when full.
    pub fn push(&self, element: T) -> bool {
        self.push_or_reclaim(element).is_none()
    }

    /// Push an element, handing it back instead of discarding it when the
    /// queue is full, so the caller can undo side effects tied to it.
    pub fn push_or_reclaim(&self, element: T) -> Option<T> {
        let should_notify;
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() + 1 > self.max_size {
                drop(queue);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("queue {} is full", self.name);
                return Some(element);
            }
            queue.push_back(element);
            should_notify = queue.len() % self.notify_every == 0;
        }
        if should_notify {
            for listener in self.listeners.lock().unwrap().iter() {
                listener();
            }
        }
        None
    }

    /// Non-blocking pop.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Pop and apply `f` until the queue is empty. Returns how many elements
    /// were consumed.
    pub fn consume_all(&self, mut f: impl FnMut(T)) -> usize {
        let mut consumed = 0;
        while let Some(element) = self.pop() {
            f(element);
            consumed += 1;
        }
        consumed
    }

    /// Register a callback fired when new data is pushed. Used to wake the
    /// thread draining this queue.
    pub fn subscribe_new_data(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(callback));
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Fans one element out to every registered queue.
///
/// Signal producers push once; both the inspection worker and the
/// last-known-state worker receive a copy through their own queues.
pub struct QueueDistributor<T: Clone> {
    queues: Vec<std::sync::Arc<BoundedQueue<T>>>,
}

impl<T: Clone> Default for QueueDistributor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> QueueDistributor<T> {
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    pub fn register_queue(&mut self, queue: std::sync::Arc<BoundedQueue<T>>) {
        self.queues.push(queue);
    }

    /// Push a copy to every registered queue. Returns how many queues
    /// accepted the element.
    pub fn push(&self, element: T) -> usize {
        let mut accepted = 0;
        for queue in &self.queues {
            if queue.push(element.clone()) {
                accepted += 1;
            }
        }
        accepted
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

/// Condvar-backed wake-up flag for worker threads.
///
/// `notify` latches: a notify arriving before the consumer parks makes the
/// next `wait` return immediately instead of sleeping through the event.
pub struct WakeSignal {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut notified = self.notified.lock().unwrap();
        *notified = true;
        self.condvar.notify_all();
    }

    /// Park until notified, or until `timeout` elapses when given. Returns
    /// true when woken by a notify, false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut notified = self.notified.lock().unwrap();
        match timeout {
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !*notified {
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    let (guard, result) = self.condvar.wait_timeout(notified, remaining).unwrap();
                    notified = guard;
                    if result.timed_out() && !*notified {
                        return false;
                    }
                }
                *notified = false;
                true
            }
            None => {
                while !*notified {
                    notified = self.condvar.wait(notified).unwrap();
                }
                *notified = false;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn push_pop_preserves_fifo_order() {
        let queue = BoundedQueue::new(4, "test");
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let queue = BoundedQueue::new(2, "test");
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(queue.len(), 2);
        // Element 3 was discarded, not queued.
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn listeners_fire_on_notify_multiples() {
        let queue = BoundedQueue::with_notify_every(100, "test", 3);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        queue.subscribe_new_data(move || {
            fired_clone.fetch_add(1, Ordering::Relaxed);
        });
        for i in 0..9 {
            queue.push(i);
        }
        // Fired at lengths 3, 6 and 9.
        assert_eq!(fired.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn consume_all_drains_everything() {
        let queue = BoundedQueue::new(10, "test");
        for i in 0..5 {
            queue.push(i);
        }
        let mut seen = Vec::new();
        let consumed = queue.consume_all(|v| seen.push(v));
        assert_eq!(consumed, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn distributor_pushes_to_all_queues() {
        let q1 = Arc::new(BoundedQueue::new(4, "q1"));
        let q2 = Arc::new(BoundedQueue::new(4, "q2"));
        let mut distributor = QueueDistributor::new();
        distributor.register_queue(Arc::clone(&q1));
        distributor.register_queue(Arc::clone(&q2));
        assert_eq!(distributor.push(7), 2);
        assert_eq!(q1.pop(), Some(7));
        assert_eq!(q2.pop(), Some(7));
    }

    #[test]
    fn distributor_reports_partial_acceptance() {
        let q1 = Arc::new(BoundedQueue::new(1, "q1"));
        let q2 = Arc::new(BoundedQueue::new(4, "q2"));
        let mut distributor = QueueDistributor::new();
        distributor.register_queue(Arc::clone(&q1));
        distributor.register_queue(Arc::clone(&q2));
        distributor.push(1);
        assert_eq!(distributor.push(2), 1);
        assert_eq!(q1.len(), 1);
        assert_eq!(q2.len(), 2);
    }

    #[test]
    fn wake_signal_latches_notify() {
        let signal = WakeSignal::new();
        signal.notify();
        // Notify arrived before the wait; must not sleep.
        assert!(signal.wait(Some(Duration::from_millis(100))));
        // Flag was consumed; the next wait times out.
        assert!(!signal.wait(Some(Duration::from_millis(10))));
    }

    #[test]
    fn wake_signal_wakes_across_threads() {
        let signal = Arc::new(WakeSignal::new());
        let signal_clone = Arc::clone(&signal);
        let handle = std::thread::spawn(move || signal_clone.wait(Some(Duration::from_secs(5))));
        std::thread::sleep(Duration::from_millis(20));
        signal.notify();
        assert!(handle.join().unwrap());
    }
}
