//! InMemoryBroker - 開発用・テスト用の broker
//!
//! 単一キューの AMQP を模倣します。
//! - publish: persistent 扱いでキュー末尾に積む（transport message id 付き）
//! - consume: `next_delivery()` で 1 件ずつ取り出す（unacked になる）
//! - ack: 削除 / nack(requeue): redelivered として末尾に戻す / nack(reject): 破棄
//! - settle せずに Delivery を drop すると requeue（channel が閉じたときの挙動）
//!
//! settle の履歴を記録するので、テストで Consumer の判断を検証できます。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::domain::{DeliveryRequest, Disposition, MessageId};
use crate::error::PortError;
use crate::ports::{Delivery, DeliverySource, Publisher};

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    message_id: Option<MessageId>,
    payload: Vec<u8>,
    redelivered: bool,
}

/// One settlement as recorded by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub message_id: Option<MessageId>,
    pub disposition: Disposition,
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<StoredMessage>,
    unacked: usize,
    published: usize,
    settlements: Vec<Settlement>,
    closed: bool,
}

struct Inner {
    state: Mutex<BrokerState>,
    available: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, message: StoredMessage) {
        self.lock().ready.push_back(message);
        self.available.notify_waiters();
    }

    fn settle(&self, message: StoredMessage, disposition: Disposition) {
        {
            let mut state = self.lock();
            state.unacked = state.unacked.saturating_sub(1);
            state.settlements.push(Settlement {
                message_id: message.message_id.clone(),
                disposition,
            });
            if disposition == Disposition::REQUEUE {
                state.ready.push_back(StoredMessage {
                    redelivered: true,
                    ..message
                });
            }
        }
        self.available.notify_waiters();
    }
}

/// Cloneable handle; every clone sees the same queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                available: Notify::new(),
            }),
        }
    }

    /// Publish raw bytes. `message_id = None` models a publisher that forgot the id.
    pub fn publish_raw(&self, routing_key: &str, message_id: Option<&str>, payload: &[u8]) {
        self.inner.lock().published += 1;
        self.inner.push(StoredMessage {
            routing_key: routing_key.to_string(),
            message_id: message_id.map(MessageId::new),
            payload: payload.to_vec(),
            redelivered: false,
        });
    }

    /// `next_delivery` は以後 None を返す（キューの中身は残る）
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.available.notify_waiters();
    }

    /// Messages waiting to be delivered.
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// Delivered but not yet settled.
    pub fn unacked_len(&self) -> usize {
        self.inner.lock().unacked
    }

    pub fn published_count(&self) -> usize {
        self.inner.lock().published
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.inner.lock().settlements.clone()
    }

    /// Routing keys of the messages still waiting, oldest first.
    pub fn ready_routing_keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .ready
            .iter()
            .map(|m| m.routing_key.clone())
            .collect()
    }

    /// Decoded copies of the waiting messages (skips undecodable payloads).
    pub fn ready_requests(&self) -> Vec<DeliveryRequest> {
        self.inner
            .lock()
            .ready
            .iter()
            .filter_map(|m| DeliveryRequest::from_bytes(&m.payload).ok())
            .collect()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, routing_key: &str, request: &DeliveryRequest) -> Result<(), PortError> {
        if self.inner.lock().closed {
            return Err(PortError::Failed("broker is closed".to_string()));
        }
        let payload = request
            .to_bytes()
            .map_err(|e| PortError::Failed(format!("encode delivery request: {e}")))?;
        self.publish_raw(routing_key, Some(request.message_id.as_str()), &payload);
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for InMemoryBroker {
    async fn next_delivery(&self) -> Option<Box<dyn Delivery>> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if state.closed {
                    return None;
                }
                if let Some(message) = state.ready.pop_front() {
                    state.unacked += 1;
                    return Some(Box::new(InMemoryDelivery {
                        inner: Arc::clone(&self.inner),
                        message: Some(message),
                    }));
                }
            }

            notified.await;
        }
    }
}

struct InMemoryDelivery {
    inner: Arc<Inner>,
    /// settle 済みなら None
    message: Option<StoredMessage>,
}

impl InMemoryDelivery {
    fn finish(mut self: Box<Self>, disposition: Disposition) -> Result<(), PortError> {
        let message = self
            .message
            .take()
            .ok_or_else(|| PortError::Failed("delivery already settled".to_string()))?;
        self.inner.settle(message, disposition);
        Ok(())
    }
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn message_id(&self) -> Option<&MessageId> {
        self.message.as_ref().and_then(|m| m.message_id.as_ref())
    }

    fn payload(&self) -> &[u8] {
        self.message
            .as_ref()
            .map(|m| m.payload.as_slice())
            .unwrap_or_default()
    }

    fn redelivered(&self) -> bool {
        self.message.as_ref().is_some_and(|m| m.redelivered)
    }

    async fn ack(self: Box<Self>) -> Result<(), PortError> {
        self.finish(Disposition::Ack)
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), PortError> {
        self.finish(Disposition::Nack { requeue })
    }
}

impl Drop for InMemoryDelivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            let mut state = self.inner.lock();
            state.unacked = state.unacked.saturating_sub(1);
            state.ready.push_front(StoredMessage {
                redelivered: true,
                ..message
            });
            drop(state);
            self.inner.available.notify_waiters();
        }
    }
}
