//! Broker port - 永続メッセージブローカー（AMQP または InMemory）
//!
//! # 設計原則
//! - publish するメッセージは persistent で、transport の message_id に重複排除キーを載せる
//! - 受け取った Delivery は Consumer が所有し、ack / nack のどちらかで必ず 1 回 settle する
//! - at-least-once: nack(requeue) や consumer のクラッシュで同じメッセージが再配送される

use async_trait::async_trait;

use crate::domain::{DeliveryRequest, Disposition, MessageId};
use crate::error::PortError;

/// Publisher は DeliveryRequest を broker に送る
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, routing_key: &str, request: &DeliveryRequest) -> Result<(), PortError>;
}

/// A delivery received from the broker.
/// The consumer owns it and must settle it exactly once (`ack` or `nack`).
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Transport-level message id. `None` when the publisher did not set one.
    fn message_id(&self) -> Option<&MessageId>;

    fn payload(&self) -> &[u8];

    /// Whether the broker has delivered this message before.
    fn redelivered(&self) -> bool {
        false
    }

    async fn ack(self: Box<Self>) -> Result<(), PortError>;

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), PortError>;
}

impl dyn Delivery {
    pub async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), PortError> {
        match disposition {
            Disposition::Ack => self.ack().await,
            Disposition::Nack { requeue } => self.nack(requeue).await,
        }
    }
}

/// Consumer side of the broker: a stream of deliveries.
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Waits for the next delivery. `None` once the source is closed.
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>>;
}
