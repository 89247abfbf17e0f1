//! RedisIdempotencyStore - 複数プロセスで共有する重複排除ストア
//!
//! # コマンド
//! - claim: `SET key processing NX EX <processing_ttl>`
//! - done: `SET key done EX <done_ttl>`
//! - release: 値が processing のときだけ DEL する Lua script
//!
//! 各呼び出しには `call_timeout` をかけ、期限切れは [`StoreError::Timeout`] にする。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use crate::domain::MessageId;
use crate::error::StoreError;
use crate::ports::{IdempotencyPolicy, IdempotencyStore, RecordState};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub struct RedisIdempotencyStore {
    connection: MultiplexedConnection,
    policy: IdempotencyPolicy,
    call_timeout: Duration,
    release: redis::Script,
}

impl RedisIdempotencyStore {
    pub async fn connect(
        redis_url: &str,
        policy: IdempotencyPolicy,
        call_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let connection = with_timeout(call_timeout, async {
            client
                .get_multiplexed_async_connection()
                .await
                .map_err(unavailable)
        })
        .await?;

        Ok(Self {
            connection,
            policy,
            call_timeout,
            release: redis::Script::new(RELEASE_SCRIPT),
        })
    }

    fn ttl_secs(&self, state: RecordState) -> u64 {
        self.policy.ttl_for(state).as_secs().max(1)
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn is_processed(&self, id: &MessageId) -> Result<bool, StoreError> {
        let key = self.policy.key(id);
        let mut conn = self.connection.clone();
        let value: Option<String> = with_timeout(self.call_timeout, async {
            redis::cmd("GET")
                .arg(&key)
                .query_async::<_, Option<String>>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await?;

        Ok(value.as_deref().and_then(RecordState::parse) == Some(RecordState::Done))
    }

    async fn mark_as_processing(&self, id: &MessageId) -> Result<bool, StoreError> {
        let key = self.policy.key(id);
        let ttl = self.ttl_secs(RecordState::Processing);
        let mut conn = self.connection.clone();
        // NX で既存キーがあると nil が返る
        let reply: Option<String> = with_timeout(self.call_timeout, async {
            redis::cmd("SET")
                .arg(&key)
                .arg(RecordState::Processing.as_str())
                .arg("NX")
                .arg("EX")
                .arg(ttl)
                .query_async::<_, Option<String>>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await?;

        Ok(reply.is_some())
    }

    async fn mark_as_processed(&self, id: &MessageId) -> Result<(), StoreError> {
        let key = self.policy.key(id);
        let ttl = self.ttl_secs(RecordState::Done);
        let mut conn = self.connection.clone();
        with_timeout(self.call_timeout, async {
            redis::cmd("SET")
                .arg(&key)
                .arg(RecordState::Done.as_str())
                .arg("EX")
                .arg(ttl)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn clear_processing(&self, id: &MessageId) -> Result<(), StoreError> {
        let key = self.policy.key(id);
        let mut conn = self.connection.clone();
        let removed: i64 = with_timeout(self.call_timeout, async {
            self.release
                .key(&key)
                .arg(RecordState::Processing.as_str())
                .invoke_async::<_, i64>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await?;

        tracing::debug!(message_id = %id, removed, "released processing claim");
        Ok(())
    }
}
