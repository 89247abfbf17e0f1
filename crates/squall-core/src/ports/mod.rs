//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。
//! パイプラインの外側（SQL リポジトリ、天気 provider、メール送信、broker、Redis）への
//! インターフェースはすべてここの trait を通します。

pub mod broker;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod idempotency;
pub mod notifier;
pub mod subscribers;
pub mod weather;

pub use self::broker::{Delivery, DeliverySource, Publisher};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, NoopEventSink};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::idempotency::{IdempotencyPolicy, IdempotencyStore, RecordState};
pub use self::notifier::Notifier;
pub use self::subscribers::SubscriberDirectory;
pub use self::weather::WeatherProvider;
