//! CronTrigger - 時刻ベースで frequency ラベルを流すイベントソース
//!
//! # 動作
//! - `start(cancel)`: hourly / daily の 2 ルールを登録して発火を始める
//! - `events()`: 発火ストリームを受け取る（1 回だけ取得できる）
//! - `stop()`: 発火を止めてストリームを閉じる
//!
//! ストリームには frequency と発火予定時刻（[`Fire`]）を流す。予定時刻は
//! cycle の識別に使うので、実際に送れた時刻ではなく occurrence そのものを入れる。
//!
//! 送信は小さいバッファ付き channel に対して行う。バッファが満杯なら待つが、
//! `cancel` されたら諦める（ログに残し、再送はしない）。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::{Frequency, PipelineEvent};
use crate::error::TriggerError;
use crate::ports::{Clock, EventSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    /// 毎時 0 分（UTC）
    pub hourly_cron: String,
    /// 毎日 12:00（UTC）
    pub daily_cron: String,
    pub buffer: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            hourly_cron: "0 * * * *".to_string(),
            daily_cron: "0 12 * * *".to_string(),
            buffer: 4,
        }
    }
}

impl TriggerConfig {
    fn expression(&self, frequency: Frequency) -> &str {
        match frequency {
            Frequency::Hourly => &self.hourly_cron,
            Frequency::Daily => &self.daily_cron,
        }
    }
}

/// One trigger firing: which frequency came due and for which occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    pub frequency: Frequency,
    pub scheduled_for: DateTime<Utc>,
}

impl Fire {
    pub fn new(frequency: Frequency, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            frequency,
            scheduled_for,
        }
    }
}

/// Parse a cron expression for one frequency rule.
pub fn parse_schedule(frequency: Frequency, expression: &str) -> Result<Cron, TriggerError> {
    Cron::new(expression)
        .parse()
        .map_err(|e| TriggerError::InvalidSchedule {
            frequency,
            expression: expression.to_string(),
            reason: e.to_string(),
        })
}

pub struct CronTrigger {
    config: TriggerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    sender: Option<mpsc::Sender<Fire>>,
    receiver: Option<mpsc::Receiver<Fire>>,
    cancel: Option<CancellationToken>,
    tracker: TaskTracker,
}

impl CronTrigger {
    pub fn new(config: TriggerConfig, clock: Arc<dyn Clock>, events: Arc<dyn EventSink>) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer.max(1));
        Self {
            config,
            clock,
            events,
            sender: Some(sender),
            receiver: Some(receiver),
            cancel: None,
            tracker: TaskTracker::new(),
        }
    }

    /// Register both rules and start firing.
    ///
    /// 不正な cron 式はここで [`TriggerError::InvalidSchedule`] になり、何も起動しない。
    pub fn start(&mut self, cancel: &CancellationToken) -> Result<(), TriggerError> {
        if self.cancel.is_some() {
            return Err(TriggerError::AlreadyStarted);
        }
        let Some(sender) = self.sender.clone() else {
            return Err(TriggerError::AlreadyStarted);
        };

        let mut rules = Vec::with_capacity(Frequency::ALL.len());
        for frequency in Frequency::ALL {
            let expression = self.config.expression(frequency);
            rules.push((frequency, parse_schedule(frequency, expression)?));
        }

        let cancel = cancel.child_token();
        for (frequency, schedule) in rules {
            let rule = Rule {
                frequency,
                schedule,
                clock: Arc::clone(&self.clock),
                events: Arc::clone(&self.events),
                sender: sender.clone(),
            };
            self.tracker.spawn(rule.run(cancel.clone()));
            tracing::info!(
                %frequency,
                expression = self.config.expression(frequency),
                "trigger rule registered"
            );
        }
        self.cancel = Some(cancel);
        Ok(())
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::Receiver<Fire>> {
        self.receiver.take()
    }

    /// Fire `frequency` immediately (manual trigger), stamped with the clock's
    /// current time. false if the send was abandoned.
    pub async fn fire(&self, cancel: &CancellationToken, frequency: Frequency) -> bool {
        let fire = Fire::new(frequency, self.clock.now());
        match &self.sender {
            Some(sender) => send_fire(sender, cancel, fire, self.events.as_ref()).await,
            None => false,
        }
    }

    /// Stop firing and close the stream once every rule task has exited.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.sender = None;
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("trigger stopped");
    }
}

struct Rule {
    frequency: Frequency,
    schedule: Cron,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    sender: mpsc::Sender<Fire>,
}

impl Rule {
    async fn run(self, cancel: CancellationToken) {
        let mut last_fire: Option<DateTime<Utc>> = None;

        loop {
            let now = self.clock.now();
            // 同じ occurrence を 2 回発火しないよう、前回の発火時刻より後を探す
            let base = last_fire.map_or(now, |last| last.max(now));
            let next = match self.schedule.find_next_occurrence(&base, false) {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(frequency = %self.frequency, error = %e, "no next occurrence");
                    return;
                }
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }

            tracing::debug!(frequency = %self.frequency, scheduled_for = %next, "trigger fired");
            let fire = Fire::new(self.frequency, next);
            if !send_fire(&self.sender, &cancel, fire, self.events.as_ref()).await {
                return;
            }
            last_fire = Some(next);
        }
    }
}

async fn send_fire(
    sender: &mpsc::Sender<Fire>,
    cancel: &CancellationToken,
    fire: Fire,
    events: &dyn EventSink,
) -> bool {
    let frequency = fire.frequency;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!(%frequency, "trigger send abandoned on shutdown");
            events.emit(PipelineEvent::TriggerDropped { frequency });
            false
        }
        sent = sender.send(fire) => match sent {
            Ok(()) => {
                events.emit(PipelineEvent::TriggerFired { frequency });
                true
            }
            Err(_) => {
                tracing::warn!(%frequency, "trigger stream closed");
                events.emit(PipelineEvent::TriggerDropped { frequency });
                false
            }
        },
    }
}
