//! Errors - 失敗の運用分類
//!
//! 各コンポーネントは失敗を `ErrorKind` で分類してログに残し、呼び出し元へ制御を返します。
//! 分類は「requeue するか / 捨てるか / ただ止まるか」を決めるためのものです。

use serde::{Deserialize, Serialize};
use std::fmt;

/// ErrorKind は実行エラーの分類
///
/// # 分類
/// - Transient: 下流（天気取得・送信）の一時的な失敗。broker 版では再配送でリトライ
/// - Malformed: id 欠落・payload 不正。リトライしない（poison message）
/// - Unavailable: idempotency store などの依存先に到達できない。重複送信を避けて requeue
/// - CircuitOpen: breaker が開いている。下流を呼ばずに即 requeue
/// - Shutdown: キャンセルによる停止。監視に上げるエラーではない
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Malformed,
    Unavailable,
    CircuitOpen,
    Shutdown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Shutdown => "shutdown",
        }
    }

    /// broker 版で再配送（nack + requeue）すべきか
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::Unavailable | ErrorKind::CircuitOpen
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
