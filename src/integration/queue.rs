//! Drop-oldest bounded queues and pipeline counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Why a captured frame was never evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Evicted by a newer frame while the queue was full
    Overflow,
    /// Sequence number not newer than the last processed frame
    OutOfOrder,
    /// No tracking session was active
    NoSession,
    /// Still queued when the session was stopped
    Stopped,
}

/// Bounded channel that never blocks the producer.
///
/// The queue keeps a receiver of its own, so when the channel is full the
/// oldest item is removed to make room for the newest one. Eviction and
/// [`pop`](Self::pop) share a lock: a consumer that takes items through
/// `pop` never frees a slot between the full check and the eviction.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    removal: Arc<Mutex<()>>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            removal: self.removal.clone(),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            removal: Arc::new(Mutex::new(())),
        }
    }

    /// Enqueue `item`, returning how many older items were evicted.
    ///
    /// An item is evicted only while the channel is still full, so a slot
    /// freed by a plain [`receiver`](Self::receiver) consumer is reused
    /// instead of costing another item.
    pub fn push(&self, item: T) -> usize {
        let _guard = self.removal.lock();
        let mut item = item;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.tx.is_full() && self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                // Unreachable while `self.rx` is alive.
                Err(TrySendError::Disconnected(_)) => return evicted + 1,
            }
        }
    }

    /// Take the oldest item, if any.
    pub fn pop(&self) -> Option<T> {
        let _guard = self.removal.lock();
        self.rx.try_recv().ok()
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Remove every queued item, returning how many there were.
    pub fn drain(&self) -> usize {
        let _guard = self.removal.lock();
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(usize::MAX)
    }
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub dropped_overflow: u64,
    pub dropped_out_of_order: u64,
    pub dropped_no_session: u64,
    pub dropped_stopped: u64,
    pub events_dropped: u64,
    pub source_errors: u64,
}

impl PipelineStats {
    pub fn frames_dropped(&self) -> u64 {
        self.dropped_overflow
            + self.dropped_out_of_order
            + self.dropped_no_session
            + self.dropped_stopped
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    frames_captured: AtomicU64,
    frames_processed: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_out_of_order: AtomicU64,
    dropped_no_session: AtomicU64,
    dropped_stopped: AtomicU64,
    events_dropped: AtomicU64,
    source_errors: AtomicU64,
}

impl StatsCounters {
    pub fn captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self, reason: DropReason, count: usize) {
        let counter = match reason {
            DropReason::Overflow => &self.dropped_overflow,
            DropReason::OutOfOrder => &self.dropped_out_of_order,
            DropReason::NoSession => &self.dropped_no_session,
            DropReason::Stopped => &self.dropped_stopped,
        };
        counter.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn events_dropped(&self, count: usize) {
        self.events_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn source_error(&self) {
        self.source_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_out_of_order: self.dropped_out_of_order.load(Ordering::Relaxed),
            dropped_no_session: self.dropped_no_session.load(Ordering::Relaxed),
            dropped_stopped: self.dropped_stopped.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = BoundedQueue::new(2);
        assert_eq!(queue.push(1), 0);
        assert_eq!(queue.push(2), 0);
        assert_eq!(queue.push(3), 1);
        assert_eq!(queue.push(4), 1);

        let rx = queue.receiver();
        assert_eq!(rx.try_recv(), Ok(3));
        assert_eq!(rx.try_recv(), Ok(4));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pop_frees_a_slot() {
        let queue = BoundedQueue::new(2);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.push(3), 0);
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_concurrent_pop_accounts_for_every_item() {
        const ITEMS: u64 = 20_000;
        let queue = BoundedQueue::new(1);
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut taken = Vec::new();
                loop {
                    match queue.pop() {
                        Some(u64::MAX) => return taken,
                        Some(item) => taken.push(item),
                        None => std::thread::yield_now(),
                    }
                }
            })
        };

        let mut evicted = 0;
        for item in 0..ITEMS {
            evicted += queue.push(item);
        }
        // The sentinel may evict the last item but is never evicted itself.
        evicted += queue.push(u64::MAX);
        let taken = consumer.join().unwrap();

        assert_eq!(taken.len() + evicted, ITEMS as usize);
        assert!(taken.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_drain() {
        let queue = BoundedQueue::new(4);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 4);
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = StatsCounters::default();
        counters.captured();
        counters.captured();
        counters.dropped(DropReason::Overflow, 1);
        counters.dropped(DropReason::Stopped, 3);
        let stats = counters.snapshot();
        assert_eq!(stats.frames_captured, 2);
        assert_eq!(stats.frames_dropped(), 4);
    }
}
