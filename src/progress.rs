//! Progress tracker and log bus (§5): a read-write-lock-guarded counter
//! block, plus a broadcast subsystem that fans log lines out to ephemeral
//! subscriber channels (a future UI/SSE layer) without blocking the
//! producer on a slow consumer.

use std::sync::{Mutex, RwLock};

use crossbeam_channel::{Receiver, Sender, TrySendError};

#[derive(Debug, Default, Clone, Copy)]
pub struct ProgressCounters {
    pub files_scanned: u64,
    pub files_hashed: u64,
    pub bytes_hashed: u64,
    pub errors: u64,
}

/// Read-write lock around counters (§5 "Progress tracker").
pub struct ProgressTracker {
    counters: RwLock<ProgressCounters>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(ProgressCounters::default()),
        }
    }

    pub fn record_scanned(&self, delta: u64) {
        self.counters.write().unwrap().files_scanned += delta;
    }

    pub fn record_hashed(&self, files: u64, bytes: u64) {
        let mut counters = self.counters.write().unwrap();
        counters.files_hashed += files;
        counters.bytes_hashed += bytes;
    }

    pub fn record_errors(&self, delta: u64) {
        self.counters.write().unwrap().errors += delta;
    }

    pub fn snapshot(&self) -> ProgressCounters {
        *self.counters.read().unwrap()
    }
}

struct Subscriber {
    sender: Sender<String>,
    stale: bool,
}

/// Fans log lines out to subscriber channels. A subscriber whose buffer is
/// full is marked stale on the next publish rather than blocking the
/// publisher; `reap_stale` drops them on a periodic sweep (§5).
#[derive(Default)]
pub struct LogBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber with a bounded buffer and returns its
    /// receiving half.
    pub fn subscribe(&self, buffer: usize) -> Receiver<String> {
        let (sender, receiver) = crossbeam_channel::bounded(buffer.max(1));
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { sender, stale: false });
        receiver
    }

    /// Non-blocking fan-out. A full or disconnected subscriber is marked
    /// stale; it is not removed here so `reap_stale` stays the single place
    /// subscribers are dropped.
    pub fn publish(&self, line: impl Into<String>) {
        let line = line.into();
        let mut subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.iter_mut() {
            if subscriber.stale {
                continue;
            }
            match subscriber.sender.try_send(line.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    subscriber.stale = true;
                }
            }
        }
    }

    /// Drops every subscriber marked stale since the last sweep.
    pub fn reap_stale(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|s| !s.stale);
        before - subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_calls() {
        let tracker = ProgressTracker::new();
        tracker.record_scanned(10);
        tracker.record_hashed(3, 4096);
        tracker.record_errors(1);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.files_scanned, 10);
        assert_eq!(snapshot.files_hashed, 3);
        assert_eq!(snapshot.bytes_hashed, 4096);
        assert_eq!(snapshot.errors, 1);
    }

    #[test]
    fn publish_fans_out_to_all_subscribers() {
        let bus = LogBus::new();
        let a = bus.subscribe(4);
        let b = bus.subscribe(4);
        bus.publish("hello");
        assert_eq!(a.try_recv().unwrap(), "hello");
        assert_eq!(b.try_recv().unwrap(), "hello");
    }

    #[test]
    fn saturated_subscriber_is_reaped_without_blocking_publisher() {
        let bus = LogBus::new();
        let slow = bus.subscribe(1);
        bus.publish("first");
        bus.publish("second"); // slow's buffer is now full, marks it stale
        bus.publish("third"); // must not block even though slow never drains

        assert_eq!(bus.reap_stale(), 1);
        assert_eq!(bus.subscriber_count(), 0);
        drop(slow);
    }
}
