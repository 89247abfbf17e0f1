//! Domain model (IDs, frequency, tasks, delivery requests, events, errors).
//!
//! - frequency: trigger が流すラベル（hourly / daily）
//! - task: Dispatcher → Worker に流れる ReportTask
//! - message: broker を流れる DeliveryRequest と重複排除キーの導出
//! - errors: 失敗の運用分類（ErrorKind）
//! - events: EventSink に渡す観測イベント

pub mod errors;
pub mod events;
pub mod frequency;
pub mod ids;
pub mod message;
pub mod task;
pub mod weather;

pub use self::errors::ErrorKind;
pub use self::events::PipelineEvent;
pub use self::frequency::{Frequency, UnknownFrequency};
pub use self::ids::{CycleId, MessageId, TaskId};
pub use self::message::{
    DeliveryRequest, Disposition, TemplateData, TemplateName, confirmation_message_id,
    report_message_id,
};
pub use self::task::{ReportTask, Subscriber};
pub use self::weather::WeatherReport;
