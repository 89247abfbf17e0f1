//! Dispatcher - frequency ラベル 1 件を subscriber ごとの ReportTask に展開する
//!
//! # 方針
//! - subscriber lookup の失敗はこの cycle だけを中断する（次の発火は通常どおり処理）
//! - 1 件の enqueue 失敗（不正 task）はログに残して fan-out を続ける
//! - shutdown 由来の失敗（Cancelled / Closed）では残りも同じく失敗するので fan-out を打ち切る
//! - この層では重複排除しない
//! - task には発火予定時刻を載せる（重複排除キーの時間バケットになる）

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::trigger::Fire;
use crate::domain::{CycleId, Frequency, PipelineEvent, ReportTask};
use crate::error::{PortError, QueueError};
use crate::ports::{EventSink, IdGenerator, SubscriberDirectory};
use crate::queue::Queue;

/// Result of one fan-out cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub cycle_id: CycleId,
    pub frequency: Frequency,
    pub scheduled_for: DateTime<Utc>,
    pub eligible: usize,
    pub enqueued: usize,
    pub failed: usize,
    /// fan-out が shutdown で打ち切られた
    pub interrupted: bool,
}

pub struct Dispatcher {
    directory: Arc<dyn SubscriberDirectory>,
    queue: Arc<dyn Queue>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn SubscriberDirectory>,
        queue: Arc<dyn Queue>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            directory,
            queue,
            ids,
            events,
        }
    }

    /// Fan out one trigger firing into the queue.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        fire: Fire,
    ) -> Result<CycleSummary, PortError> {
        let Fire {
            frequency,
            scheduled_for,
        } = fire;
        let cycle_id = self.ids.generate_cycle_id();

        let subscribers = match self.directory.list_eligible(frequency).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                tracing::error!(%cycle_id, %frequency, error = %e, "subscriber lookup failed; cycle aborted");
                self.events.emit(PipelineEvent::CycleAborted { frequency });
                return Err(e);
            }
        };

        let mut summary = CycleSummary {
            cycle_id,
            frequency,
            scheduled_for,
            eligible: subscribers.len(),
            enqueued: 0,
            failed: 0,
            interrupted: false,
        };

        for subscriber in subscribers {
            let task = ReportTask::new(
                self.ids.generate_task_id(),
                frequency,
                scheduled_for,
                subscriber,
            );
            let task_id = task.task_id();

            match self.queue.enqueue(cancel, task).await {
                Ok(()) => summary.enqueued += 1,
                Err(QueueError::InvalidTask(reason)) => {
                    summary.failed += 1;
                    tracing::warn!(%cycle_id, %task_id, %reason, "task rejected by queue");
                }
                Err(e @ (QueueError::Cancelled | QueueError::Closed)) => {
                    summary.failed += 1;
                    summary.interrupted = true;
                    tracing::warn!(%cycle_id, %task_id, error = %e, "fan-out stopped by shutdown");
                    break;
                }
            }
        }

        tracing::info!(
            %cycle_id,
            %frequency,
            %scheduled_for,
            eligible = summary.eligible,
            enqueued = summary.enqueued,
            failed = summary.failed,
            "cycle dispatched"
        );
        self.events.emit(PipelineEvent::CycleDispatched {
            cycle_id,
            frequency,
            enqueued: summary.enqueued,
            failed: summary.failed,
        });
        Ok(summary)
    }

    /// Consume the trigger stream until it closes or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken, mut fires: mpsc::Receiver<Fire>) {
        loop {
            let fire = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = fires.recv() => match next {
                    Some(fire) => fire,
                    None => break,
                },
            };

            // 失敗はログとイベントで報告済み。次の発火を待つ
            if let Ok(summary) = self.dispatch(&cancel, fire).await {
                if summary.interrupted {
                    break;
                }
            }
        }
        tracing::info!("dispatcher stopped");
    }
}
