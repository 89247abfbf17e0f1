//! Events - パイプラインで発生したイベント
//!
//! `EventSink` port に渡される観測用イベントです。グローバルなカウンタは持たず、
//! 各コンポーネントは注入された sink にイベントを渡すだけにします。

use super::{CycleId, Disposition, ErrorKind, Frequency, MessageId, TaskId};

/// PipelineEvent はパイプラインで発生したイベント
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// trigger が frequency を stream に流した
    TriggerFired { frequency: Frequency },

    /// shutdown 中で trigger の送信を諦めた
    TriggerDropped { frequency: Frequency },

    /// 1 cycle 分の fan-out が終わった
    CycleDispatched {
        cycle_id: CycleId,
        frequency: Frequency,
        enqueued: usize,
        failed: usize,
    },

    /// subscriber lookup の失敗で cycle を中断した
    CycleAborted { frequency: Frequency },

    TaskCompleted { task_id: TaskId },

    TaskFailed { task_id: TaskId, kind: ErrorKind },

    TaskPanicked { task_id: TaskId },

    /// Consumer が 1 件の delivery を settle した（message id の無い delivery は `None`）
    MessageSettled {
        message_id: Option<MessageId>,
        disposition: Disposition,
    },
}
