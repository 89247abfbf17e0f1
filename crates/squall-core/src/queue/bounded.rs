//! In-memory bounded queue implementation.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::Queue;
use crate::domain::ReportTask;
use crate::error::QueueError;

/// Buffer and closed flag live under the same lock so that
/// "closed" and "has items" are always observed together.
struct BoundedQueueState {
    items: VecDeque<ReportTask>,
    closed: bool,
}

/// Fixed-capacity FIFO queue.
///
/// ロックは std の Mutex（await を跨がない）。待ちは Notify で行い、
/// `notified()` を enable してから状態を見るので wakeup を取りこぼさない。
pub struct BoundedQueue {
    capacity: usize,
    state: Mutex<BoundedQueueState>,
    not_empty: Notify,
    not_full: Notify,
}

impl BoundedQueue {
    /// `capacity` は 1 以上に丸める。
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(BoundedQueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, BoundedQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(task: &ReportTask) -> Result<(), QueueError> {
        if task.recipient_email().trim().is_empty() {
            return Err(QueueError::InvalidTask(format!(
                "task {} has an empty recipient",
                task.task_id()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for BoundedQueue {
    async fn enqueue(
        &self,
        cancel: &CancellationToken,
        task: ReportTask,
    ) -> Result<(), QueueError> {
        Self::validate(&task)?;

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if cancel.is_cancelled() {
                    return Err(QueueError::Cancelled);
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(task);
                    drop(state);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<ReportTask, QueueError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                // closed でもバッファが残っていれば先に返す
                if let Some(task) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_waiters();
                    return Ok(task);
                }
                if state.closed {
                    return Err(QueueError::Closed);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use rstest::rstest;
    use ulid::Ulid;

    use super::*;
    use crate::domain::{Frequency, Subscriber, TaskId};

    fn task(email: &str) -> ReportTask {
        ReportTask::new(
            TaskId::from_ulid(Ulid::new()),
            Frequency::Hourly,
            Utc::now(),
            Subscriber::new(email, "Kyiv", "tok"),
        )
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = BoundedQueue::new(3);
        let cancel = CancellationToken::new();

        for email in ["a@x.com", "b@x.com", "c@x.com"] {
            queue.enqueue(&cancel, task(email)).await.unwrap();
        }

        assert_eq!(queue.len(), 3);
        for email in ["a@x.com", "b@x.com", "c@x.com"] {
            assert_eq!(queue.dequeue(&cancel).await.unwrap().recipient_email(), email);
        }
        assert!(queue.is_empty());
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[tokio::test]
    async fn empty_recipient_is_rejected_without_waiting(#[case] email: &str) {
        // 満杯でも待たずに弾く
        let queue = BoundedQueue::new(1);
        let cancel = CancellationToken::new();
        queue.enqueue(&cancel, task("a@x.com")).await.unwrap();

        let err = queue.enqueue(&cancel, task(email)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTask(_)));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_until_a_slot_frees() {
        let queue = Arc::new(BoundedQueue::new(1));
        let cancel = CancellationToken::new();
        queue.enqueue(&cancel, task("a@x.com")).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.enqueue(&cancel, task("b@x.com")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        let first = queue.dequeue(&cancel).await.unwrap();
        assert_eq!(first.recipient_email(), "a@x.com");

        producer.await.unwrap().unwrap();
        assert_eq!(queue.dequeue(&cancel).await.unwrap().recipient_email(), "b@x.com");
    }

    #[tokio::test]
    async fn blocked_enqueue_returns_cancelled() {
        let queue = Arc::new(BoundedQueue::new(1));
        let cancel = CancellationToken::new();
        queue.enqueue(&cancel, task("a@x.com")).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.enqueue(&cancel, task("b@x.com")).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        assert_eq!(producer.await.unwrap(), Err(QueueError::Cancelled));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn blocked_dequeue_returns_cancelled() {
        let queue = BoundedQueue::new(1);
        let cancel = CancellationToken::new();

        let child = cancel.child_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        assert_eq!(queue.dequeue(&child).await, Err(QueueError::Cancelled));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_wakes_pending_callers() {
        let queue = Arc::new(BoundedQueue::new(1));
        let cancel = CancellationToken::new();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.dequeue(&cancel).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.close() })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap();
        }
        queue.close();

        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), Err(QueueError::Closed));
        }
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn close_wakes_blocked_producers() {
        let queue = Arc::new(BoundedQueue::new(1));
        let cancel = CancellationToken::new();
        queue.enqueue(&cancel, task("a@x.com")).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.enqueue(&cancel, task("b@x.com")).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        assert_eq!(producer.await.unwrap(), Err(QueueError::Closed));
    }

    #[tokio::test]
    async fn buffered_items_drain_after_close() {
        let queue = BoundedQueue::new(4);
        let cancel = CancellationToken::new();
        queue.enqueue(&cancel, task("a@x.com")).await.unwrap();
        queue.enqueue(&cancel, task("b@x.com")).await.unwrap();

        queue.close();

        assert_eq!(
            queue.enqueue(&cancel, task("c@x.com")).await,
            Err(QueueError::Closed)
        );
        assert_eq!(queue.dequeue(&cancel).await.unwrap().recipient_email(), "a@x.com");
        assert_eq!(queue.dequeue(&cancel).await.unwrap().recipient_email(), "b@x.com");
        assert_eq!(queue.dequeue(&cancel).await, Err(QueueError::Closed));
    }

    #[test]
    fn zero_capacity_is_rounded_up() {
        assert_eq!(BoundedQueue::new(0).capacity(), 1);
    }
}
