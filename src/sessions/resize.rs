//! Single-slot terminal resize queue.
//!
//! Holds only the most recent size. A push never blocks: a newer size
//! overwrites one the consumer has not taken yet. Closing the queue wakes the
//! consumer, which then receives the `{0, 0}` "no more resizes" size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// `{0, 0}` marks the end of the resize stream.
    pub fn is_sentinel(self) -> bool {
        self.rows == 0 && self.cols == 0
    }
}

#[derive(Default)]
pub struct ResizeQueue {
    slot: Mutex<Option<TerminalSize>>,
    closed: AtomicBool,
    notify: Notify,
}

impl ResizeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `size`, replacing any size not yet taken. Returns `false` if the
    /// queue is closed.
    pub fn push(&self, size: TerminalSize) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(size);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next size. Returns `{0, 0}` once the queue is closed and
    /// drained.
    pub async fn next(&self) -> TerminalSize {
        loop {
            let notified = self.notify.notified();
            if let Some(size) = self.slot.lock().ok().and_then(|mut slot| slot.take()) {
                return size;
            }
            if self.closed.load(Ordering::Acquire) {
                return TerminalSize::default();
            }
            notified.await;
        }
    }

    /// Close the queue and release a waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn newest_size_wins() {
        let q = ResizeQueue::new();
        assert!(q.push(TerminalSize::new(10, 20)));
        assert!(q.push(TerminalSize::new(40, 120)));
        assert_eq!(q.next().await, TerminalSize::new(40, 120));
    }

    #[tokio::test]
    async fn push_never_blocks_without_a_consumer() {
        let q = ResizeQueue::new();
        for i in 1..=1000u16 {
            assert!(q.push(TerminalSize::new(i, i)));
        }
        assert_eq!(q.next().await, TerminalSize::new(1000, 1000));
    }

    #[tokio::test]
    async fn consumer_wakes_on_push() {
        let q = Arc::new(ResizeQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(TerminalSize::new(24, 80));
        assert_eq!(waiter.await.unwrap(), TerminalSize::new(24, 80));
    }

    #[tokio::test]
    async fn close_releases_consumer_with_sentinel() {
        let q = Arc::new(ResizeQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        let size = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(size.is_sentinel());
        assert!(!q.push(TerminalSize::new(1, 1)));
    }

    #[tokio::test]
    async fn pending_size_is_delivered_before_sentinel() {
        let q = ResizeQueue::new();
        q.push(TerminalSize::new(30, 90));
        q.close();
        assert_eq!(q.next().await, TerminalSize::new(30, 90));
        assert!(q.next().await.is_sentinel());
    }
}
