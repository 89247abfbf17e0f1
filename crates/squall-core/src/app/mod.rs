//! App - アプリケーション層
//!
//! ports を組み合わせてパイプラインを実装します。
//!
//! # 主要コンポーネント
//! - **CronTrigger**: 時刻ベースで frequency ラベルを流す
//! - **Dispatcher**: ラベル 1 件を subscriber ごとの task に展開して queue へ
//! - **WorkerPool**: queue を drain して天気を取得し、送信または publish
//! - **Consumer**: broker の delivery を重複排除して送信
//! - **PipelineBuilder**: 構築とワイヤリング（fail-fast）

pub mod builder;
pub mod consumer;
pub mod dispatcher;
pub mod trigger;
pub mod worker_pool;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Pipeline, PipelineBuilder, RunningPipeline};
pub use self::consumer::{Consumer, ConsumerConfig};
pub use self::dispatcher::{CycleSummary, Dispatcher};
pub use self::trigger::{CronTrigger, Fire, TriggerConfig, parse_schedule};
pub use self::worker_pool::{DeliveryMode, WorkerPool, WorkerPoolConfig};
