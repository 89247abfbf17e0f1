//! squall-core
//!
//! Core building blocks for the squall weather-report pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, frequency, task, message, events, errors）
//! - **ports**: 抽象化レイヤー（SubscriberDirectory, WeatherProvider, Notifier, broker, IdempotencyStore, Clock など）
//! - **queue**: Dispatcher と Worker Pool の間の bounded queue
//! - **breaker**: 連続失敗で送信を止める circuit breaker
//! - **app**: trigger, dispatcher, worker pool, consumer, builder
//! - **impls**: ports の実装（InMemory, Redis, AMQP）
//! - **config**: TOML + 環境変数の設定
//! - **observability**: tracing の初期化とイベント集計
//!
//! # データの流れ
//! ```text
//! CronTrigger ─frequency─▶ Dispatcher ─ReportTask─▶ BoundedQueue ─▶ WorkerPool
//!                                                                    │
//!                                  Direct: Notifier ◀────────────────┤
//!                                  Broker: Publisher ─▶ broker ─▶ Consumer ─▶ Notifier
//! ```

pub mod app;
pub mod breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

#[cfg(test)]
pub(crate) mod testing;

pub use crate::config::SquallConfig;
pub use crate::error::SquallError;
