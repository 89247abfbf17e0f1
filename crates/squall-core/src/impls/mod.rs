//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryIdempotencyStore**: 開発用・テスト用の重複排除ストア
//! - **InMemoryBroker**: 開発用・テスト用の broker（Publisher + DeliverySource）
//! - **RedisIdempotencyStore**: feature `redis`
//! - **AmqpBroker**: feature `amqp`

pub mod inmem_broker;
pub mod inmem_idempotency;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "redis")]
pub mod redis_idempotency;

pub use self::inmem_broker::{InMemoryBroker, Settlement};
pub use self::inmem_idempotency::InMemoryIdempotencyStore;

#[cfg(feature = "amqp")]
pub use self::amqp::{AmqpBroker, AmqpDeliverySource, AmqpTopology};
#[cfg(feature = "redis")]
pub use self::redis_idempotency::RedisIdempotencyStore;
