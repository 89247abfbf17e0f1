//! IdempotencyStore port - 重複排除ゲート
//!
//! `idemp:<messageId> -> "processing" | "done"`（TTL 付き）を保持します。
//!
//! # 状態遷移
//! ```text
//! absent --mark_as_processing--> processing --mark_as_processed--> done
//!    ^                               |                               |
//!    +------clear_processing---------+                               |
//!    +------------------------------TTL 満了-------------------------+
//! ```
//!
//! # 設計原則
//! - `mark_as_processing` は set-if-absent でアトミックに claim する
//!   （read-then-write だと並行 consumer が両方 claim できてしまう）
//! - `clear_processing` は processing の claim だけを外す。done は消さない
//! - processing の TTL は cleanup 自体が失敗したときの最後の砦

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::MessageId;
use crate::error::StoreError;

/// 1 件のレコードの状態（absent はレコードなし）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Processing,
    Done,
}

impl RecordState {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordState::Processing => "processing",
            RecordState::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(RecordState::Processing),
            "done" => Some(RecordState::Done),
            _ => None,
        }
    }
}

/// Key layout and TTLs shared by every store implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    pub key_prefix: String,
    pub processing_ttl: Duration,
    pub done_ttl: Duration,
}

impl IdempotencyPolicy {
    pub fn key(&self, id: &MessageId) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    pub fn ttl_for(&self, state: RecordState) -> Duration {
        match state {
            RecordState::Processing => self.processing_ttl,
            RecordState::Done => self.done_ttl,
        }
    }
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            key_prefix: "idemp:".to_string(),
            processing_ttl: Duration::from_secs(5 * 60),
            done_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// IdempotencyStore は message id ごとの処理状態を管理
///
/// 複数の consumer（別プロセスを含む）から並行に呼ばれる前提。
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// 以前の試行が完了していれば true
    async fn is_processed(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// claim を取る。すでに誰かが持っていれば false
    async fn mark_as_processing(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// done に遷移（長い TTL）
    async fn mark_as_processed(&self, id: &MessageId) -> Result<(), StoreError>;

    /// processing の claim を外す（done は残す）
    async fn clear_processing(&self, id: &MessageId) -> Result<(), StoreError>;
}
