//! Message - broker を流れる配送リクエスト
//!
//! # 重複排除キーの導出
//! `MessageId` は「同じ論理配送なら同じ値」になるよう決定的に導出します。
//! - 定期レポート: recipient + template + cycle の時間バケット（hourly は時、daily は日）
//! - 購読確認: recipient + token
//!
//! 再配送や worker の再起動で同じリクエストが再 publish されても、
//! Consumer 側の idempotency gate で 2 通目の送信が抑止されます。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Frequency, MessageId, ReportTask, WeatherReport};

/// Email template used by the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateName {
    Confirmation,
    WeatherReport,
}

impl TemplateName {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateName::Confirmation => "confirmation",
            TemplateName::WeatherReport => "weather_report",
        }
    }
}

impl std::fmt::Display for TemplateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type TemplateData = BTreeMap<String, String>;

/// Delivery request published to the broker and decoded by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    pub message_id: MessageId,
    pub recipient: String,
    pub template_name: TemplateName,
    #[serde(default)]
    pub template_data: TemplateData,
}

impl DeliveryRequest {
    /// Weather report for one task, bucketed by the cycle the task was dispatched in.
    pub fn weather_report(task: &ReportTask, report: &WeatherReport) -> Self {
        Self {
            message_id: report_message_id(
                task.recipient_email(),
                task.frequency(),
                task.scheduled_for(),
            ),
            recipient: task.recipient_email().to_string(),
            template_name: TemplateName::WeatherReport,
            template_data: report_template_data(task, report),
        }
    }

    /// One-shot subscription confirmation.
    pub fn confirmation(recipient: &str, token: &str, confirm_url: &str) -> Self {
        let mut data = TemplateData::new();
        data.insert("token".to_string(), token.to_string());
        data.insert("confirm_url".to_string(), confirm_url.to_string());
        Self {
            message_id: confirmation_message_id(recipient, token),
            recipient: recipient.to_string(),
            template_name: TemplateName::Confirmation,
            template_data: data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// How a broker delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

impl Disposition {
    pub const REQUEUE: Disposition = Disposition::Nack { requeue: true };
    pub const REJECT: Disposition = Disposition::Nack { requeue: false };
}

/// Template variables for a weather report email.
pub fn report_template_data(task: &ReportTask, report: &WeatherReport) -> TemplateData {
    let mut data = TemplateData::new();
    data.insert("city".to_string(), task.city().to_string());
    data.insert("frequency".to_string(), task.frequency().to_string());
    data.insert("temperature".to_string(), format!("{:.1}", report.temperature));
    data.insert("humidity".to_string(), format!("{:.0}", report.humidity));
    data.insert("description".to_string(), report.description.clone());
    data.insert(
        "unsubscribe_token".to_string(),
        task.unsubscribe_token().to_string(),
    );
    data
}

/// 定期レポートの重複排除キー
///
/// 同じ時間バケット内で同じ宛先に 2 回 publish されても同じ id になる。
pub fn report_message_id(recipient: &str, frequency: Frequency, at: DateTime<Utc>) -> MessageId {
    let bucket = match frequency {
        Frequency::Hourly => at.format("%Y%m%d%H").to_string(),
        Frequency::Daily => at.format("%Y%m%d").to_string(),
    };
    MessageId::new(format!(
        "{}:{}:{}:{}",
        TemplateName::WeatherReport,
        frequency,
        bucket,
        normalize_recipient(recipient)
    ))
}

/// 購読確認メールの重複排除キー
pub fn confirmation_message_id(recipient: &str, token: &str) -> MessageId {
    MessageId::new(format!(
        "{}:{}:{}",
        TemplateName::Confirmation,
        normalize_recipient(recipient),
        token
    ))
}

fn normalize_recipient(recipient: &str) -> String {
    recipient.trim().to_ascii_lowercase()
}
