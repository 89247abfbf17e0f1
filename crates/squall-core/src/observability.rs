//! Observability: tracing の初期化と、注入型のイベント集計
//!
//! プロセス全体のメトリクスレジストリは持たない。コンポーネントは
//! `EventSink` に `PipelineEvent` を渡すだけで、集計はここの
//! [`CountingEventSink`] が行う。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::domain::{Disposition, ErrorKind, PipelineEvent};
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Initialize tracing for the process. `RUST_LOG` overrides the default `info` filter.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
    };
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCounts {
    pub triggers_fired: usize,
    pub triggers_dropped: usize,
    pub cycles_dispatched: usize,
    pub cycles_aborted: usize,
    pub tasks_enqueued: usize,
    pub tasks_rejected: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_panicked: usize,
    pub failures_by_kind: HashMap<ErrorKind, usize>,
    pub messages_acked: usize,
    pub messages_requeued: usize,
    pub messages_rejected: usize,
}

/// EventSink that keeps running totals.
#[derive(Debug, Default)]
pub struct CountingEventSink {
    counts: Mutex<PipelineCounts>,
}

impl CountingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PipelineCounts {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for CountingEventSink {
    fn emit(&self, event: PipelineEvent) {
        let mut c = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match event {
            PipelineEvent::TriggerFired { .. } => c.triggers_fired += 1,
            PipelineEvent::TriggerDropped { .. } => c.triggers_dropped += 1,
            PipelineEvent::CycleDispatched {
                enqueued, failed, ..
            } => {
                c.cycles_dispatched += 1;
                c.tasks_enqueued += enqueued;
                c.tasks_rejected += failed;
            }
            PipelineEvent::CycleAborted { .. } => c.cycles_aborted += 1,
            PipelineEvent::TaskCompleted { .. } => c.tasks_completed += 1,
            PipelineEvent::TaskFailed { kind, .. } => {
                c.tasks_failed += 1;
                *c.failures_by_kind.entry(kind).or_default() += 1;
            }
            PipelineEvent::TaskPanicked { .. } => c.tasks_panicked += 1,
            PipelineEvent::MessageSettled { disposition, .. } => match disposition {
                Disposition::Ack => c.messages_acked += 1,
                Disposition::Nack { requeue: true } => c.messages_requeued += 1,
                Disposition::Nack { requeue: false } => c.messages_rejected += 1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Frequency, MessageId, TaskId};
    use ulid::Ulid;

    #[test]
    fn counts_follow_emitted_events() {
        let sink = CountingEventSink::new();
        let task_id = TaskId::from_ulid(Ulid::new());

        sink.emit(PipelineEvent::TriggerFired { frequency: Frequency::Daily });
        sink.emit(PipelineEvent::TaskFailed { task_id, kind: ErrorKind::Transient });
        sink.emit(PipelineEvent::TaskFailed { task_id, kind: ErrorKind::Transient });
        sink.emit(PipelineEvent::MessageSettled {
            message_id: Some(MessageId::new("m-1")),
            disposition: Disposition::REQUEUE,
        });

        let counts = sink.snapshot();
        assert_eq!(counts.triggers_fired, 1);
        assert_eq!(counts.tasks_failed, 2);
        assert_eq!(counts.failures_by_kind[&ErrorKind::Transient], 2);
        assert_eq!(counts.messages_requeued, 1);
        assert_eq!(counts.messages_acked, 0);
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
