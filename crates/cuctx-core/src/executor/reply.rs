//! One-shot reply slots carried alongside queued messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A single-use slot one thread fills and another waits on.
pub(crate) struct Reply<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Reply<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    pub(crate) fn send(&self, value: T) {
        *self.value.lock() = Some(value);
        self.ready.notify_all();
    }

    /// Block until a value is sent.
    pub(crate) fn wait(&self) -> T {
        let mut slot = self.value.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            self.ready.wait(&mut slot);
        }
    }

    /// Block until a value is sent or `timeout` elapses.
    ///
    /// A timeout too large to express as a deadline waits indefinitely.
    pub(crate) fn wait_for(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut slot = self.value.lock();
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            if self.ready.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }
}

/// Signals its reply when dropped.
///
/// Attached to shutdown requests so the closer wakes up whether the run loop
/// handled the request or discarded it along with its queue.
pub(crate) struct Ack(Arc<Reply<()>>);

impl Ack {
    pub(crate) fn new() -> (Self, Arc<Reply<()>>) {
        let reply = Reply::new();
        (Self(Arc::clone(&reply)), reply)
    }
}

impl Drop for Ack {
    fn drop(&mut self) {
        self.0.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_send_then_wait() {
        let reply = Reply::new();
        reply.send(7);
        assert_eq!(reply.wait(), 7);
    }

    #[test]
    fn test_wait_across_threads() {
        let reply = Reply::new();
        let sender = Arc::clone(&reply);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.send("done");
        });
        assert_eq!(reply.wait(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let reply: Arc<Reply<u32>> = Reply::new();
        let start = Instant::now();
        assert_eq!(reply.wait_for(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_for_unbounded_timeout() {
        let reply = Reply::new();
        let sender = Arc::clone(&reply);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sender.send(11u32);
        });
        assert_eq!(reply.wait_for(Duration::MAX), Some(11));
        handle.join().unwrap();
    }

    #[test]
    fn test_ack_fires_on_drop() {
        let (ack, reply) = Ack::new();
        let handle = thread::spawn(move || drop(ack));
        reply.wait();
        handle.join().unwrap();
    }
}
