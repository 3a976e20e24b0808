//! Per-variable pending response buffer
//!
//! The bus receive thread pushes each correlated response into the buffer of
//! its variable; the owning producer waits on the buffer and drains it. The
//! queue and its bookkeeping live under one `Mutex`, with a `Condvar` to wake
//! the producer when a response lands.
//!
//! Admission keeps the queue non-decreasing in timestamp:
//!
//! - the leading sample of a response whose timestamp equals the latest
//!   admitted timestamp is a window-boundary duplicate and is discarded
//! - samples older than the latest admitted timestamp are dropped

use crate::types::{LatestSample, SamplePoint};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Counters of a buffer's admission decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Responses pushed
    pub responses: u64,
    /// Samples queued
    pub admitted: u64,
    /// Window-boundary duplicates discarded
    pub duplicates_discarded: u64,
    /// Samples older than the latest admitted one
    pub out_of_order_dropped: u64,
}

#[derive(Debug)]
struct Inner {
    queue: VecDeque<SamplePoint>,
    latest: Option<LatestSample>,
    last_response: Option<Instant>,
    stats: BufferStats,
    interrupted: bool,
}

/// FIFO of samples waiting to be delivered for one variable
#[derive(Debug)]
pub struct PendingBuffer {
    name: String,
    created: Instant,
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl PendingBuffer {
    /// Create a buffer, optionally seeded with the latest known sample
    pub fn new(name: impl Into<String>, seed: Option<LatestSample>) -> Self {
        Self {
            name: name.into(),
            created: Instant::now(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                latest: seed,
                last_response: None,
                stats: BufferStats::default(),
                interrupted: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Variable the buffer belongs to
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the samples of one response and wake the producer
    ///
    /// Returns the number of samples admitted.
    pub fn push_response(&self, points: impl IntoIterator<Item = SamplePoint>) -> usize {
        let mut inner = self.lock();
        let mut admitted = 0;
        for (index, point) in points.into_iter().enumerate() {
            if let Some(latest) = inner.latest {
                if point.timestamp == latest.timestamp && index == 0 {
                    inner.stats.duplicates_discarded += 1;
                    tracing::trace!("{}: discarded boundary duplicate at {}", self.name, point.timestamp);
                    continue;
                }
                if point.timestamp < latest.timestamp {
                    inner.stats.out_of_order_dropped += 1;
                    tracing::debug!(
                        "{}: dropped sample at {} older than {}",
                        self.name,
                        point.timestamp,
                        latest.timestamp
                    );
                    continue;
                }
            }
            inner.latest = Some(point);
            inner.queue.push_back(point);
            admitted += 1;
        }
        inner.stats.responses += 1;
        inner.stats.admitted += admitted as u64;
        inner.last_response = Some(Instant::now());
        drop(inner);
        self.ready.notify_all();
        admitted
    }

    /// Number of responses pushed so far
    pub fn responses(&self) -> u64 {
        self.lock().stats.responses
    }

    /// Wait until a response newer than `seen` arrives, then drain the queue
    ///
    /// `seen` is a value previously returned by [`responses`](Self::responses).
    /// Returns `None` if no new response arrived within `timeout` or the
    /// wait was interrupted by [`wake`](Self::wake).
    pub fn wait_and_drain(&self, seen: u64, timeout: Duration) -> Option<Vec<SamplePoint>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.stats.responses == seen {
            let now = Instant::now();
            if inner.interrupted || now >= deadline {
                return None;
            }
            inner = self
                .ready
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        Some(inner.queue.drain(..).collect())
    }

    /// Take everything queued without waiting
    pub fn drain(&self) -> Vec<SamplePoint> {
        self.lock().queue.drain(..).collect()
    }

    /// Interrupt a producer blocked in [`wait_and_drain`](Self::wait_and_drain)
    ///
    /// Later waits return immediately unless a response is already pending.
    pub fn wake(&self) {
        self.lock().interrupted = true;
        self.ready.notify_all();
    }

    /// Number of queued samples
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Latest admitted (or seeded) sample
    pub fn latest(&self) -> Option<LatestSample> {
        self.lock().latest
    }

    /// Time since the last response, or since creation if none arrived
    pub fn silent_for(&self) -> Duration {
        self.lock()
            .last_response
            .unwrap_or(self.created)
            .elapsed()
    }

    /// Time of the last response
    pub fn last_response(&self) -> Option<Instant> {
        self.lock().last_response
    }

    /// Admission counters
    pub fn stats(&self) -> BufferStats {
        self.lock().stats
    }
}
