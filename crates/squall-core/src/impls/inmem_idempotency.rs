//! InMemoryIdempotencyStore - 開発用・テスト用の重複排除ストア
//!
//! # 実装詳細
//! - `HashMap<String, Entry>` を Mutex で保護（await を跨がない）
//! - TTL は Clock 基準で判定し、期限切れのエントリは参照時に absent とみなす
//! - 書き込み時に期限切れエントリをまとめて掃除する（processing TTL ごとに最大 1 回）
//! - set-if-absent は 1 回のロック内で判定と書き込みを行う

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::MessageId;
use crate::error::StoreError;
use crate::ports::{Clock, IdempotencyPolicy, IdempotencyStore, RecordState};

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: RecordState,
    expires_at: DateTime<Utc>,
}

struct Entries {
    map: HashMap<String, Entry>,
    next_sweep: DateTime<Utc>,
}

impl Entries {
    /// Drop every expired entry once `now` passes the sweep deadline.
    fn sweep(&mut self, now: DateTime<Utc>, interval: chrono::Duration) {
        if now < self.next_sweep {
            return;
        }
        let before = self.map.len();
        self.map.retain(|_, e| e.expires_at > now);
        let removed = before - self.map.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.map.len(), "expired idempotency records swept");
        }
        self.next_sweep = now + interval;
    }
}

pub struct InMemoryIdempotencyStore {
    policy: IdempotencyPolicy,
    clock: Arc<dyn Clock>,
    entries: Mutex<Entries>,
}

impl InMemoryIdempotencyStore {
    pub fn new(policy: IdempotencyPolicy, clock: Arc<dyn Clock>) -> Self {
        let next_sweep = clock.now();
        Self {
            policy,
            clock,
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                next_sweep,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ttl(&self, state: RecordState) -> chrono::Duration {
        chrono::Duration::from_std(self.policy.ttl_for(state))
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }

    fn expiry(&self, state: RecordState) -> DateTime<Utc> {
        self.clock.now() + self.ttl(state)
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live state for `id`, dropping an expired entry.
    pub fn state_of(&self, id: &MessageId) -> Option<RecordState> {
        let key = self.policy.key(id);
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.map.get(&key) {
            Some(entry) if entry.expires_at > now => Some(entry.state),
            Some(_) => {
                entries.map.remove(&key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn is_processed(&self, id: &MessageId) -> Result<bool, StoreError> {
        Ok(self.state_of(id) == Some(RecordState::Done))
    }

    async fn mark_as_processing(&self, id: &MessageId) -> Result<bool, StoreError> {
        let key = self.policy.key(id);
        let now = self.clock.now();
        let expires_at = self.expiry(RecordState::Processing);

        let mut entries = self.lock();
        entries.sweep(now, self.ttl(RecordState::Processing));
        if let Some(entry) = entries.map.get(&key) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }
        entries.map.insert(
            key,
            Entry {
                state: RecordState::Processing,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn mark_as_processed(&self, id: &MessageId) -> Result<(), StoreError> {
        let key = self.policy.key(id);
        let now = self.clock.now();
        let expires_at = self.expiry(RecordState::Done);
        let mut entries = self.lock();
        entries.sweep(now, self.ttl(RecordState::Processing));
        entries.map.insert(
            key,
            Entry {
                state: RecordState::Done,
                expires_at,
            },
        );
        Ok(())
    }

    async fn clear_processing(&self, id: &MessageId) -> Result<(), StoreError> {
        let key = self.policy.key(id);
        let mut entries = self.lock();
        if matches!(entries.map.get(&key), Some(e) if e.state == RecordState::Processing) {
            entries.map.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;
    use crate::ports::FixedClock;

    fn store() -> (Arc<InMemoryIdempotencyStore>, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let policy = IdempotencyPolicy {
            key_prefix: "idemp:".to_string(),
            processing_ttl: Duration::from_secs(60),
            done_ttl: Duration::from_secs(3600),
        };
        (
            Arc::new(InMemoryIdempotencyStore::new(policy, clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let (store, _clock) = store();
        let id = MessageId::new("m-1");

        assert!(store.mark_as_processing(&id).await.unwrap());
        assert!(!store.mark_as_processing(&id).await.unwrap());

        store.clear_processing(&id).await.unwrap();
        assert!(store.mark_as_processing(&id).await.unwrap());
    }

    #[tokio::test]
    async fn release_never_removes_a_done_record() {
        let (store, _clock) = store();
        let id = MessageId::new("m-1");

        assert!(store.mark_as_processing(&id).await.unwrap());
        store.mark_as_processed(&id).await.unwrap();
        store.clear_processing(&id).await.unwrap();

        assert!(store.is_processed(&id).await.unwrap());
        assert!(!store.mark_as_processing(&id).await.unwrap());
    }

    #[tokio::test]
    async fn stale_claim_expires_after_processing_ttl() {
        let (store, clock) = store();
        let id = MessageId::new("m-1");

        assert!(store.mark_as_processing(&id).await.unwrap());
        clock.advance(chrono::Duration::seconds(61));

        assert_eq!(store.state_of(&id), None);
        assert!(store.mark_as_processing(&id).await.unwrap());
    }

    #[tokio::test]
    async fn done_record_expires_after_done_ttl() {
        let (store, clock) = store();
        let id = MessageId::new("m-1");
        store.mark_as_processed(&id).await.unwrap();

        clock.advance(chrono::Duration::minutes(59));
        assert!(store.is_processed(&id).await.unwrap());

        clock.advance(chrono::Duration::minutes(2));
        assert!(!store.is_processed(&id).await.unwrap());
    }

    #[tokio::test]
    async fn expired_records_are_swept_on_the_next_write() {
        let (store, clock) = store();
        for n in 0..1_000 {
            let id = MessageId::new(format!("m-{n}"));
            assert!(store.mark_as_processing(&id).await.unwrap());
            if n % 2 == 0 {
                store.mark_as_processed(&id).await.unwrap();
            }
        }
        assert_eq!(store.len(), 1_000);

        clock.advance(chrono::Duration::days(30));
        assert!(store.mark_as_processing(&MessageId::new("m-new")).await.unwrap());

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn sweep_keeps_live_records() {
        let (store, clock) = store();
        let done = MessageId::new("m-done");
        let stale = MessageId::new("m-stale");
        store.mark_as_processed(&done).await.unwrap();
        assert!(store.mark_as_processing(&stale).await.unwrap());

        // processing TTL は過ぎたが done TTL はまだ
        clock.advance(chrono::Duration::minutes(5));
        store.mark_as_processed(&MessageId::new("m-other")).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.is_processed(&done).await.unwrap());
        assert_eq!(store.state_of(&stale), None);
    }

    #[tokio::test]
    async fn concurrent_claims_have_a_single_winner() {
        let (store, _clock) = store();
        let id = MessageId::new("m-race");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                let id = id.clone();
                tokio::spawn(async move { store.mark_as_processing(&id).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
