//! Circuit breaker - 連続失敗で下流への呼び出しを一時停止する
//!
//! # 状態
//! - Closed: `open_until` が過去（またはなし）。呼び出しを許可
//! - Open: `now < open_until`。呼び出しを拒否
//!
//! half-open の試行状態は持たない。cooldown が明けた最初の `can_execute()` で
//! Closed に戻り、カウンタもリセットされる。
//!
//! 時刻は注入された [`Clock`] から取るので、テストでは FixedClock で cooldown を進められる。

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ports::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// この回数連続で失敗したら open
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            cooldown: Duration::from_secs(5),
        }
    }
}

/// Observed breaker state (for logs and status output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
}

/// Shared breaker guarding one downstream (the notifier in the consumer).
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// false while open. An expired open breaker is reset to closed first.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        match state.open_until {
            Some(until) if now < until => false,
            Some(_) => {
                *state = BreakerState::default();
                tracing::info!("circuit breaker closed after cooldown");
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        *self.lock() = BreakerState::default();
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.consecutive_failures >= self.config.failure_threshold {
            // chrono::Duration への変換は cooldown が極端に大きいときだけ失敗する
            let cooldown = chrono::Duration::from_std(self.config.cooldown)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            let until = now + cooldown;
            if state.open_until.is_none() {
                tracing::warn!(
                    failures = state.consecutive_failures,
                    open_until = %until,
                    "circuit breaker opened"
                );
            }
            state.open_until = Some(until);
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        match self.lock().open_until {
            Some(until) if now < until => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }
}
