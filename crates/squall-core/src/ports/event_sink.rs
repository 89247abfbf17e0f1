//! EventSink port - イベント記録の抽象化
//!
//! プロセス全体のグローバルなメトリクスレジストリは持たず、
//! 各コンポーネントに sink を明示的に注入します。
//!
//! # 実装
//! - NoopEventSink: 何もしない（デフォルト）
//! - CountingEventSink: カウンタに集計（`observability` 参照）

use crate::domain::PipelineEvent;

/// EventSink はパイプラインイベントを記録
///
/// 呼び出し側はホットパスで呼ぶので、実装はブロックしないこと。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: PipelineEvent) {}
}
