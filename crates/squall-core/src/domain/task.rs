use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Frequency, TaskId};

/// One eligible subscription as returned by the subscriber directory
/// (confirmed, not unsubscribed, matching the requested frequency).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub email: String,
    pub city: String,
    pub token: String,
}

impl Subscriber {
    pub fn new(email: impl Into<String>, city: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            city: city.into(),
            token: token.into(),
        }
    }
}

/// Recipient + city + unsubscribe token の“運搬用”データ。
///
/// Dispatcher が生成し、Worker が 1 回だけ消費する。生成後は変更しない
/// （フィールドは private、読み取りは getter のみ）。
///
/// `scheduled_for` は task が属する cycle の発火予定時刻。重複排除キーの
/// 時間バケットはこれから決まるので、worker が遅れて処理しても変わらない。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTask {
    task_id: TaskId,
    frequency: Frequency,
    scheduled_for: DateTime<Utc>,
    recipient_email: String,
    city: String,
    unsubscribe_token: String,
}

impl ReportTask {
    pub fn new(
        task_id: TaskId,
        frequency: Frequency,
        scheduled_for: DateTime<Utc>,
        subscriber: Subscriber,
    ) -> Self {
        Self {
            task_id,
            frequency,
            scheduled_for,
            recipient_email: subscriber.email,
            city: subscriber.city,
            unsubscribe_token: subscriber.token,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn frequency(&self) -> Frequency {
        self.frequency
    }

    pub fn scheduled_for(&self) -> DateTime<Utc> {
        self.scheduled_for
    }

    pub fn recipient_email(&self) -> &str {
        &self.recipient_email
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn unsubscribe_token(&self) -> &str {
        &self.unsubscribe_token
    }
}
