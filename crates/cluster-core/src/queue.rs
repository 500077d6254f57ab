//! Bounded handoff queue between message producers and the dispatch worker.
//!
//! Producers push single items; the consumer swaps out the whole pending
//! buffer at once. Both critical sections are O(1), so neither side holds the
//! lock across a drain.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Inner<T> {
    items: Vec<T>,
    enabled: bool,
    max_len: usize,
}

pub struct HandoffQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> HandoffQueue<T> {
    /// Create an enabled queue holding at most `max_len` items (0 = unbounded).
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                enabled: true,
                max_len,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue one item. Returns false when the queue is full or disabled.
    pub fn add(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.enabled {
                return false;
            }
            if inner.max_len > 0 && inner.items.len() >= inner.max_len {
                return false;
            }
            inner.items.push(item);
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait up to `timeout` for items and take everything pending.
    ///
    /// Returns an empty vec on timeout or when the queue is disabled.
    pub async fn remove(&self, timeout: Duration) -> Vec<T> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent add can't slip by.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if !inner.enabled {
                    return Vec::new();
                }
                if !inner.items.is_empty() {
                    return std::mem::take(&mut inner.items);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Vec::new();
            }
        }
    }

    /// Disabling drops pending items and wakes blocked removers.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.enabled = enabled;
            if !enabled {
                inner.items.clear();
            }
        }
        if !enabled {
            self.notify.notify_waiters();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).enabled
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_then_remove_drains_everything() {
        let queue = HandoffQueue::new(0);
        assert!(queue.add(1));
        assert!(queue.add(2));
        assert!(queue.add(3));

        let items = queue.remove(Duration::from_millis(10)).await;
        assert_eq!(items, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_bounded_rejects_when_full() {
        let queue = HandoffQueue::new(2);
        assert!(queue.add("a"));
        assert!(queue.add("b"));
        assert!(!queue.add("c"));
        assert_eq!(queue.len(), 2);

        queue.remove(Duration::from_millis(10)).await;
        assert!(queue.add("c"));
    }

    #[tokio::test]
    async fn test_remove_times_out_empty() {
        let queue: HandoffQueue<u32> = HandoffQueue::new(0);
        let start = Instant::now();
        let items = queue.remove(Duration::from_millis(50)).await;
        assert!(items.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_blocked_remover_wakes_on_add() {
        let queue = Arc::new(HandoffQueue::new(0));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.remove(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.add(42));

        let items = consumer.await.unwrap();
        assert_eq!(items, vec![42]);
    }

    #[tokio::test]
    async fn test_disable_clears_and_wakes() {
        let queue = Arc::new(HandoffQueue::new(0));
        queue.add(1);
        queue.remove(Duration::from_millis(1)).await;

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.remove(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.set_enabled(false);
        let items = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("remover should wake when disabled")
            .unwrap();
        assert!(items.is_empty());
        assert!(!queue.is_enabled());
        assert!(!queue.add(2));
    }

    #[tokio::test]
    async fn test_disable_drops_pending_items() {
        let queue = HandoffQueue::new(0);
        queue.add(1);
        queue.add(2);
        queue.set_enabled(false);
        assert!(queue.is_empty());

        queue.set_enabled(true);
        assert!(queue.add(3));
        assert_eq!(queue.remove(Duration::from_millis(10)).await, vec![3]);
    }
}
