//! Bounded multi-producer/single-consumer queue between loggers and the
//! dispatch loop.
//!
//! Producers may be plain threads ([`DispatchQueue::try_offer`],
//! [`DispatchQueue::offer_blocking`]) or tokio tasks
//! ([`DispatchQueue::offer`]). Only the dispatch loop calls
//! [`DispatchQueue::recv`].

use crate::config::DispatchConfig;
use crate::error::OfferError;
use crate::record::LogEvent;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// What happens to an offer when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverloadPolicy {
    /// Discard the incoming event.
    DropNewest,
    /// Evict the oldest queued event to admit the incoming one.
    #[default]
    DropOldest,
    /// Wait for space up to the block timeout, then fail with
    /// [`OfferError::QueueTimeout`].
    Block,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown overload policy: {0:?}")]
pub struct ParsePolicyError(pub String);

impl std::str::FromStr for OverloadPolicy {
    type Err = ParsePolicyError;

    /// Accepts `DROP_NEWEST`, `drop-newest`, `DropNewest` and so on.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "dropnewest" => Ok(OverloadPolicy::DropNewest),
            "dropoldest" => Ok(OverloadPolicy::DropOldest),
            "block" => Ok(OverloadPolicy::Block),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Successful outcome of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// Accepted after evicting the oldest queued event.
    AcceptedEvictingOldest,
    /// Discarded under [`OverloadPolicy::DropNewest`].
    Dropped,
}

impl Offer {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Offer::Dropped)
    }
}

/// Snapshot of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub len: usize,
    /// Offer attempts, whatever their outcome.
    pub offered: u64,
    pub enqueued: u64,
    /// Events lost to `DropNewest` or evicted by `DropOldest`.
    pub dropped: u64,
    /// `Block` offers that gave up waiting.
    pub timed_out: u64,
    /// Events still queued when the shutdown deadline passed.
    pub discarded: u64,
}

#[derive(Default)]
struct QueueCounters {
    offered: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    discarded: AtomicU64,
}

struct Inner {
    events: VecDeque<LogEvent>,
    closed: bool,
}

enum Admit {
    Done(Offer),
    Full(LogEvent),
}

pub struct DispatchQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: OverloadPolicy,
    block_timeout: Duration,
    /// Wakes the consumer.
    items: Notify,
    /// Wakes producers suspended on a tokio task.
    space: Notify,
    /// Wakes producers parked on a thread.
    space_cv: Condvar,
    counters: QueueCounters,
}

impl DispatchQueue {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize, policy: OverloadPolicy, block_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        DispatchQueue {
            inner: Mutex::new(Inner {
                events: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            capacity,
            policy,
            block_timeout,
            items: Notify::new(),
            space: Notify::new(),
            space_cv: Condvar::new(),
            counters: QueueCounters::default(),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        DispatchQueue::new(config.queue_capacity, config.overload_policy, config.block_timeout())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverloadPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn admit_locked(&self, inner: &mut Inner, event: LogEvent) -> Result<Admit, OfferError> {
        if inner.closed {
            return Err(OfferError::Closed);
        }
        if inner.events.len() < self.capacity {
            inner.events.push_back(event);
            return Ok(Admit::Done(Offer::Accepted));
        }
        match self.policy {
            OverloadPolicy::DropNewest => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(Admit::Done(Offer::Dropped))
            }
            OverloadPolicy::DropOldest => {
                inner.events.pop_front();
                inner.events.push_back(event);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(Admit::Done(Offer::AcceptedEvictingOldest))
            }
            OverloadPolicy::Block => Ok(Admit::Full(event)),
        }
    }

    // Called with the lock released.
    fn finish(&self, offer: Offer) -> Offer {
        if offer.is_accepted() {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            self.items.notify_one();
        }
        offer
    }

    fn time_out(&self, waited: Duration) -> OfferError {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        OfferError::QueueTimeout(waited)
    }

    /// Offer without ever waiting. Under [`OverloadPolicy::Block`] a full
    /// queue fails immediately with a zero-length [`OfferError::QueueTimeout`].
    pub fn try_offer(&self, event: LogEvent) -> Result<Offer, OfferError> {
        self.counters.offered.fetch_add(1, Ordering::Relaxed);
        let admitted = {
            let mut inner = self.inner.lock();
            self.admit_locked(&mut inner, event)?
        };
        match admitted {
            Admit::Done(offer) => Ok(self.finish(offer)),
            Admit::Full(_) => Err(self.time_out(Duration::ZERO)),
        }
    }

    /// Offer from a plain thread. Under [`OverloadPolicy::Block`] the thread
    /// is parked until space frees up or the block timeout elapses.
    ///
    /// Inside a tokio task use [`offer`](Self::offer) instead; a parked
    /// current-thread runtime cannot run the dispatch loop that makes room.
    pub fn offer_blocking(&self, event: LogEvent) -> Result<Offer, OfferError> {
        if self.policy != OverloadPolicy::Block {
            return self.try_offer(event);
        }
        self.counters.offered.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + self.block_timeout;
        let mut event = event;
        let mut inner = self.inner.lock();
        loop {
            match self.admit_locked(&mut inner, event)? {
                Admit::Done(offer) => {
                    drop(inner);
                    return Ok(self.finish(offer));
                }
                Admit::Full(back) => {
                    event = back;
                    if Instant::now() >= deadline {
                        return Err(self.time_out(self.block_timeout));
                    }
                    self.space_cv.wait_until(&mut inner, deadline);
                }
            }
        }
    }

    /// Offer from a tokio task. Under [`OverloadPolicy::Block`] the task is
    /// suspended until space frees up or the block timeout elapses; the drop
    /// policies complete without suspending.
    pub async fn offer(&self, event: LogEvent) -> Result<Offer, OfferError> {
        if self.policy != OverloadPolicy::Block {
            return self.try_offer(event);
        }
        self.counters.offered.fetch_add(1, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + self.block_timeout;
        let mut event = event;
        loop {
            let notified = self.space.notified();
            let admitted = {
                let mut inner = self.inner.lock();
                self.admit_locked(&mut inner, event)?
            };
            match admitted {
                Admit::Done(offer) => return Ok(self.finish(offer)),
                Admit::Full(back) => {
                    event = back;
                    if tokio::time::Instant::now() >= deadline {
                        return Err(self.time_out(self.block_timeout));
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(self.time_out(self.block_timeout));
                    }
                }
            }
        }
    }

    fn space_freed(&self, all: bool) {
        if all {
            self.space.notify_waiters();
            self.space_cv.notify_all();
        } else {
            self.space.notify_one();
            self.space_cv.notify_one();
        }
    }

    pub fn try_recv(&self) -> Option<LogEvent> {
        let event = self.inner.lock().events.pop_front();
        if event.is_some() {
            self.space_freed(false);
        }
        event
    }

    /// Next event in FIFO order. Resolves to `None` once the queue is closed
    /// and empty.
    pub async fn recv(&self) -> Option<LogEvent> {
        loop {
            let notified = self.items.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(event) = inner.events.pop_front() {
                    drop(inner);
                    self.space_freed(false);
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop admitting events. Already queued events stay available to
    /// [`recv`](Self::recv); waiting producers fail with [`OfferError::Closed`].
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.items.notify_one();
        self.space_freed(true);
    }

    /// Drop everything still queued and count it as discarded.
    pub fn discard_remaining(&self) -> u64 {
        let n = {
            let mut inner = self.inner.lock();
            let n = inner.events.len() as u64;
            inner.events.clear();
            n
        };
        self.counters.discarded.fetch_add(n, Ordering::Relaxed);
        self.space_freed(true);
        n
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            len: self.len(),
            offered: self.counters.offered.load(Ordering::Relaxed),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn event(n: usize) -> LogEvent {
        LogEvent::builder(Level::Info, "queue::test")
            .message(format!("event {}", n))
            .build()
            .unwrap()
    }

    fn drain(queue: &DispatchQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.try_recv())
            .map(|e| e.message().to_string())
            .collect()
    }

    fn messages(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
        range.map(|n| format!("event {}", n)).collect()
    }

    #[test]
    fn drop_newest_keeps_first_c_events() {
        let queue = DispatchQueue::new(4, OverloadPolicy::DropNewest, Duration::ZERO);
        for n in 1..=4 {
            assert_eq!(queue.try_offer(event(n)), Ok(Offer::Accepted));
        }
        assert_eq!(queue.try_offer(event(5)), Ok(Offer::Dropped));

        let stats = queue.stats();
        assert_eq!(stats.len, 4);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.offered, 5);
        assert_eq!(drain(&queue), messages(1..=4));
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let queue = DispatchQueue::new(4, OverloadPolicy::DropOldest, Duration::ZERO);
        for n in 1..=4 {
            queue.try_offer(event(n)).unwrap();
        }
        assert_eq!(queue.try_offer(event(5)), Ok(Offer::AcceptedEvictingOldest));

        assert_eq!(queue.stats().dropped, 1);
        assert_eq!(drain(&queue), messages(2..=5));
    }

    #[test]
    fn try_offer_under_block_fails_fast_when_full() {
        let queue = DispatchQueue::new(1, OverloadPolicy::Block, Duration::from_secs(10));
        queue.try_offer(event(1)).unwrap();
        assert_eq!(queue.try_offer(event(2)), Err(OfferError::QueueTimeout(Duration::ZERO)));
        assert_eq!(queue.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn block_times_out_not_before_deadline() {
        let timeout = Duration::from_millis(60);
        let queue = DispatchQueue::new(1, OverloadPolicy::Block, timeout);
        queue.offer(event(1)).await.unwrap();

        let started = tokio::time::Instant::now();
        let result = queue.offer(event(2)).await;
        assert_eq!(result, Err(OfferError::QueueTimeout(timeout)));
        assert!(started.elapsed() >= timeout);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn blocking_offer_times_out_on_thread() {
        let timeout = Duration::from_millis(40);
        let queue = DispatchQueue::new(1, OverloadPolicy::Block, timeout);
        queue.offer_blocking(event(1)).unwrap();

        let started = Instant::now();
        let result = queue.offer_blocking(event(2));
        assert_eq!(result, Err(OfferError::QueueTimeout(timeout)));
        assert!(started.elapsed() >= timeout);
    }

    #[tokio::test]
    async fn blocked_producer_resumes_when_consumer_drains() {
        let queue = Arc::new(DispatchQueue::new(1, OverloadPolicy::Block, Duration::from_secs(5)));
        queue.offer(event(1)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.offer(event(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(queue.recv().await.unwrap().message(), "event 1");
        assert_eq!(producer.await.unwrap(), Ok(Offer::Accepted));
        assert_eq!(queue.recv().await.unwrap().message(), "event 2");
    }

    #[test]
    fn blocked_thread_resumes_when_consumer_drains() {
        let queue = Arc::new(DispatchQueue::new(1, OverloadPolicy::Block, Duration::from_secs(5)));
        queue.offer_blocking(event(1)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.offer_blocking(event(2)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.try_recv().is_some());

        assert_eq!(producer.join().unwrap(), Ok(Offer::Accepted));
        assert_eq!(drain(&queue), messages(2..=2));
    }

    #[tokio::test]
    async fn close_rejects_offers_but_keeps_queued_events() {
        let queue = DispatchQueue::new(4, OverloadPolicy::DropOldest, Duration::ZERO);
        queue.try_offer(event(1)).unwrap();
        queue.close();

        assert_eq!(queue.try_offer(event(2)), Err(OfferError::Closed));
        assert_eq!(queue.recv().await.unwrap().message(), "event 1");
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_blocked_producer() {
        let queue = Arc::new(DispatchQueue::new(1, OverloadPolicy::Block, Duration::from_secs(5)));
        queue.offer(event(1)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.offer(event(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        assert_eq!(producer.await.unwrap(), Err(OfferError::Closed));
    }

    #[test]
    fn discard_remaining_counts_events() {
        let queue = DispatchQueue::new(8, OverloadPolicy::DropOldest, Duration::ZERO);
        for n in 0..3 {
            queue.try_offer(event(n)).unwrap();
        }
        assert_eq!(queue.discard_remaining(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().discarded, 3);
    }

    #[test]
    fn policy_names_parse_loosely() {
        assert_eq!("DROP_NEWEST".parse(), Ok(OverloadPolicy::DropNewest));
        assert_eq!("drop-oldest".parse(), Ok(OverloadPolicy::DropOldest));
        assert_eq!(" Block ".parse(), Ok(OverloadPolicy::Block));
        assert!("drop".parse::<OverloadPolicy>().is_err());
    }

    proptest! {
        #[test]
        fn fifo_order_is_preserved(count in 1usize..64, capacity in 64usize..128) {
            let queue = DispatchQueue::new(capacity, OverloadPolicy::DropNewest, Duration::ZERO);
            for n in 0..count {
                queue.try_offer(event(n)).unwrap();
            }
            let expected: Vec<String> = (0..count).map(|n| format!("event {}", n)).collect();
            prop_assert_eq!(drain(&queue), expected);
        }

        #[test]
        fn drop_oldest_keeps_the_newest_window(count in 1usize..64, capacity in 1usize..16) {
            let queue = DispatchQueue::new(capacity, OverloadPolicy::DropOldest, Duration::ZERO);
            for n in 0..count {
                queue.try_offer(event(n)).unwrap();
            }
            let first = count.saturating_sub(capacity);
            let expected: Vec<String> = (first..count).map(|n| format!("event {}", n)).collect();
            prop_assert_eq!(queue.stats().dropped as usize, first);
            prop_assert_eq!(drain(&queue), expected);
        }
    }
}
