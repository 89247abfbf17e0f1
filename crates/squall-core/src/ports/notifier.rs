//! Notifier port - メール送信（send use case）
//!
//! ローカル版では Worker が直接呼び、broker 版では Consumer の背後で呼ばれる。

use async_trait::async_trait;

use crate::domain::{TemplateData, TemplateName};
use crate::error::PortError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateName,
        data: &TemplateData,
    ) -> Result<(), PortError>;
}
