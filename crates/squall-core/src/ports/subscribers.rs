//! SubscriberDirectory port - 購読者の検索
//!
//! 実体は SQL リポジトリ（このクレートの外）。Dispatcher だけが呼ぶ。

use async_trait::async_trait;

use crate::domain::{Frequency, Subscriber};
use crate::error::PortError;

/// SubscriberDirectory は frequency に一致する配信対象を返す
///
/// 返すのは confirmed かつ unsubscribe されていない購読だけ。
#[async_trait]
pub trait SubscriberDirectory: Send + Sync {
    async fn list_eligible(&self, frequency: Frequency) -> Result<Vec<Subscriber>, PortError>;
}
