//! Bounded single-producer/single-consumer frame queue
//!
//! The producer never blocks: when the queue is full the oldest buffered
//! frame is evicted to make room, so a slow consumer sees at most `capacity`
//! frames of staleness. The consumer suspends in [`FrameRelayQueue::pull`]
//! until a frame arrives or the queue is closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::data::Frame;
use crate::{Error, Result};

/// Default relay queue capacity (two seconds of 30 fps video)
pub const DEFAULT_QUEUE_CAPACITY: usize = 60;

/// Result of a non-blocking push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Frame queued without displacing anything
    Queued,
    /// Frame queued after evicting the oldest buffered frame (returned)
    Evicted(Frame),
    /// Queue already closed; the frame was dropped
    Closed,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Frames accepted by `push`
    pub pushed: u64,
    /// Frames handed out by `pull`
    pub pulled: u64,
    /// Frames evicted because the queue was full
    pub evicted: u64,
}

struct Inner {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// Bounded FIFO of frames with drop-oldest backpressure
pub struct FrameRelayQueue {
    name: String,
    capacity: usize,
    inner: Mutex<Inner>,
    available: Notify,
    pushed: AtomicU64,
    pulled: AtomicU64,
    evicted: AtomicU64,
}

impl FrameRelayQueue {
    /// Create a queue with a fixed capacity
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when `capacity` is zero.
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(Error::InvalidConfig(format!(
                "relay queue '{}' capacity must be greater than 0",
                name
            )));
        }

        Ok(Self::with_capacity_unchecked(name, capacity))
    }

    /// Create a queue with [`DEFAULT_QUEUE_CAPACITY`]
    pub fn with_default_capacity(name: impl Into<String>) -> Self {
        Self::with_capacity_unchecked(name.into(), DEFAULT_QUEUE_CAPACITY)
    }

    fn with_capacity_unchecked(name: String, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
            pushed: AtomicU64::new(0),
            pulled: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Queue name (used in logs)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push a frame without blocking, evicting the oldest frame if full
    pub fn push(&self, frame: Frame) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }

            let evicted = if inner.frames.len() >= self.capacity {
                inner.frames.pop_front()
            } else {
                None
            };
            inner.frames.push_back(frame);

            match evicted {
                Some(old) => PushOutcome::Evicted(old),
                None => PushOutcome::Queued,
            }
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if let PushOutcome::Evicted(old) = &outcome {
            let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(
                queue = %self.name,
                evicted_pts = old.pts(),
                total_evicted = total,
                "Relay queue full, evicted oldest frame"
            );
        }

        self.available.notify_one();
        outcome
    }

    /// Wait for the next frame
    ///
    /// Returns `None` once the queue is closed; this is the closed sentinel
    /// and is distinct from any frame delivery. No timeout is applied.
    pub async fn pull(&self) -> Option<Frame> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking state so a close() or push() between
            // the check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    drop(inner);
                    self.pulled.fetch_add(1, Ordering::Relaxed);
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the next frame if one is buffered
    pub fn try_pull(&self) -> Option<Frame> {
        let frame = self.inner.lock().frames.pop_front();
        if frame.is_some() {
            self.pulled.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Close the queue, discard buffered frames and wake every waiter
    ///
    /// Idempotent. Returns the number of frames discarded by this call.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return 0;
            }
            inner.closed = true;
            let n = inner.frames.len();
            inner.frames.clear();
            n
        };

        debug!(queue = %self.name, discarded, "Relay queue closed");
        self.available.notify_waiters();
        discarded
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of buffered frames
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Check if no frames are buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames evicted so far
    pub fn evicted_count(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Snapshot of the queue counters
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FrameRelayQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRelayQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PixelFormat;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    fn frame(id: i64) -> Frame {
        Frame::filled(2, 2, PixelFormat::Gray8, id, 0).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            FrameRelayQueue::new("q", 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_default_capacity() {
        let queue = FrameRelayQueue::with_default_capacity("q");
        assert_eq!(queue.capacity(), 60);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let queue = FrameRelayQueue::new("q", 3).unwrap();
        for id in 0..3 {
            assert_eq!(queue.push(frame(id)), PushOutcome::Queued);
        }

        match queue.push(frame(3)) {
            PushOutcome::Evicted(old) => assert_eq!(old.pts(), 0),
            other => panic!("expected eviction, got {:?}", other),
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.evicted_count(), 1);
        let remaining: Vec<i64> = std::iter::from_fn(|| queue.try_pull())
            .map(|f| f.pts())
            .collect();
        assert_eq!(remaining, vec![1, 2, 3]);
    }

    #[test]
    fn test_push_after_close_is_dropped() {
        let queue = FrameRelayQueue::new("q", 2).unwrap();
        queue.push(frame(0));
        assert_eq!(queue.close(), 1);
        assert_eq!(queue.close(), 0);
        assert_eq!(queue.push(frame(1)), PushOutcome::Closed);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pull_waits_for_push() {
        let queue = FrameRelayQueue::new("q", 4).unwrap();
        let mut pull = task::spawn(queue.pull());

        assert_pending!(pull.poll());
        queue.push(frame(42));
        assert!(pull.is_woken());

        let got = assert_ready!(pull.poll()).expect("frame");
        assert_eq!(got.pts(), 42);
        assert_eq!(queue.stats().pulled, 1);
    }

    #[tokio::test]
    async fn test_close_unblocks_pull() {
        let queue = Arc::new(FrameRelayQueue::new("q", 4).unwrap());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pull().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("pull must wake on close")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_pull_on_closed_queue_returns_immediately() {
        let queue = FrameRelayQueue::new("q", 1).unwrap();
        queue.close();
        assert!(queue.pull().await.is_none());
    }
}
