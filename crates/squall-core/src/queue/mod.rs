//! Queue module: Dispatcher と Worker Pool の間のバッファ
//!
//! v1 はプロセス内の [`BoundedQueue`] のみ。trait は実装差し替えの継ぎ目。

mod bounded;

pub use bounded::BoundedQueue;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::ReportTask;
use crate::error::QueueError;

/// Queue port (interface).
///
/// Design intent:
/// - Producer は容量が空くまで待つ（backpressure）。待ちは `cancel` で打ち切れる
/// - `close()` 後は enqueue が必ず失敗し、残っている task は dequeue で取り出せる
/// - `dequeue` が [`QueueError::Closed`] を返したら end-of-stream
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue a task, waiting for space.
    async fn enqueue(&self, cancel: &CancellationToken, task: ReportTask)
    -> Result<(), QueueError>;

    /// Take the oldest task, waiting until one is available.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<ReportTask, QueueError>;

    /// Stop accepting tasks. Idempotent; wakes every pending caller.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Number of buffered tasks.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
