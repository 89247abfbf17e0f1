//! Consumer - broker の delivery を重複排除して送信する
//!
//! # 1 件の delivery の判定順
//! 1. message id なし → reject（nack, requeue なし）
//! 2. breaker open → requeue。idempotency store には触らない
//! 3. 処理済み → ack
//! 4. claim 取得失敗（他インスタンスが処理中）→ ack
//! 5. payload の decode 失敗 → reject、claim は解放
//! 6. 送信成功 → done に遷移、breaker success、ack
//!    送信失敗 → breaker failure、claim 解放、requeue
//!
//! store が使えないとき（3, 4）は requeue。
//!
//! # claim の解放
//! 解放は本処理のあとに独立した短い timeout 付きで行い、本処理を止めた
//! cancellation の影響を受けない。unit ごと drop された場合も [`ClaimGuard`] の
//! Drop が解放を spawn する。`clear_processing` は done を消さないので、
//! 成功時に解放が走っても重複排除は崩れない。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::breaker::CircuitBreaker;
use crate::domain::{DeliveryRequest, Disposition, MessageId, PipelineEvent};
use crate::ports::{Delivery, DeliverySource, EventSink, IdempotencyStore, Notifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// claim 解放 1 回分の timeout
    pub cleanup_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            cleanup_timeout: Duration::from_secs(2),
            max_in_flight: 8,
        }
    }
}

pub struct Consumer {
    store: Arc<dyn IdempotencyStore>,
    breaker: Arc<CircuitBreaker>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventSink>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        breaker: Arc<CircuitBreaker>,
        notifier: Arc<dyn Notifier>,
        events: Arc<dyn EventSink>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            notifier,
            events,
            config,
        }
    }

    /// Decide and settle one delivery. Returns the disposition that was applied.
    pub async fn handle(&self, cancel: &CancellationToken, delivery: Box<dyn Delivery>) -> Disposition {
        let message_id = delivery.message_id().filter(|id| !id.is_empty()).cloned();

        let disposition = match &message_id {
            None => {
                tracing::warn!(redelivered = delivery.redelivered(), "delivery without message id rejected");
                Disposition::REJECT
            }
            Some(id) => self.process(cancel, id, delivery.payload()).await,
        };

        if let Err(e) = delivery.settle(disposition).await {
            tracing::warn!(message_id = ?message_id, error = %e, "settle failed");
        }
        self.events.emit(PipelineEvent::MessageSettled {
            message_id,
            disposition,
        });
        disposition
    }

    async fn process(&self, cancel: &CancellationToken, id: &MessageId, payload: &[u8]) -> Disposition {
        if !self.breaker.can_execute() {
            tracing::debug!(message_id = %id, "circuit open; requeue");
            return Disposition::REQUEUE;
        }

        match self.store.is_processed(id).await {
            Ok(true) => {
                tracing::debug!(message_id = %id, "already processed");
                return Disposition::Ack;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "idempotency store unavailable");
                return Disposition::REQUEUE;
            }
        }

        match self.store.mark_as_processing(id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(message_id = %id, "claimed by another consumer");
                return Disposition::Ack;
            }
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "idempotency store unavailable");
                return Disposition::REQUEUE;
            }
        }

        let claim = ClaimGuard::new(
            Arc::clone(&self.store),
            id.clone(),
            self.config.cleanup_timeout,
        );
        let disposition = self.deliver(cancel, id, payload).await;
        claim.release().await;
        disposition
    }

    /// Steps after a successful claim: decode, send, record.
    async fn deliver(&self, cancel: &CancellationToken, id: &MessageId, payload: &[u8]) -> Disposition {
        let request = match DeliveryRequest::from_bytes(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "malformed payload rejected");
                return Disposition::REJECT;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(message_id = %id, "send interrupted by shutdown");
                return Disposition::REQUEUE;
            }
            sent = self.notifier.send(&request.recipient, request.template_name, &request.template_data) => sent,
        };

        match sent {
            Ok(()) => {
                if let Err(e) = self.store.mark_as_processed(id).await {
                    // 送信は済んでいるので ack する。done が残らない分は再配送時に重複しうる
                    tracing::warn!(message_id = %id, error = %e, "failed to record processed message");
                }
                self.breaker.record_success();
                tracing::info!(message_id = %id, template = %request.template_name, "message sent");
                Disposition::Ack
            }
            Err(e) => {
                self.breaker.record_failure();
                tracing::warn!(message_id = %id, error = %e, "send failed; requeue");
                Disposition::REQUEUE
            }
        }
    }

    /// Consume `source` until it ends or `cancel` fires, then wait for in-flight deliveries.
    pub async fn run(self: Arc<Self>, source: Arc<dyn DeliverySource>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let delivery = tokio::select! {
                _ = cancel.cancelled() => break,
                delivery = source.next_delivery() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let consumer = Arc::clone(&self);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let _permit = permit;
                consumer.handle(&cancel, delivery).await;
            });
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("consumer stopped");
    }
}

/// Processing claim that must be released exactly once.
struct ClaimGuard {
    store: Arc<dyn IdempotencyStore>,
    id: Option<MessageId>,
    timeout: Duration,
}

impl ClaimGuard {
    fn new(store: Arc<dyn IdempotencyStore>, id: MessageId, timeout: Duration) -> Self {
        Self {
            store,
            id: Some(id),
            timeout,
        }
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            release_claim(Arc::clone(&self.store), id, self.timeout).await;
        }
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_claim(Arc::clone(&self.store), id, self.timeout));
            }
            Err(_) => {
                tracing::warn!(message_id = %id, "no runtime to release claim; it will expire by TTL");
            }
        }
    }
}

async fn release_claim(store: Arc<dyn IdempotencyStore>, id: MessageId, limit: Duration) {
    match tokio::time::timeout(limit, store.clear_processing(&id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(message_id = %id, error = %e, "claim release failed"),
        Err(_) => tracing::warn!(message_id = %id, "claim release timed out"),
    }
}
