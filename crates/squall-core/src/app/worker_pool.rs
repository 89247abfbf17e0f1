//! WorkerPool - queue を drain して 1 task ずつ独立した unit of work として実行する
//!
//! # 実行モデル
//! - dequeue するループは 1 本。task ごとに TaskTracker 上へ spawn する
//! - 同時実行数は Semaphore で上限をかける（permit を取ってから dequeue）
//! - 各 unit は固定の timeout（既定 30s）で打ち切る
//! - unit 内の panic は捕まえてログに残す。pool 自体は止まらない
//! - ループは queue の Closed か `cancel` で抜け、実行中の unit の終了を待ってから返る
//!
//! # 配送モード
//! - `Direct`: Notifier で直接送る（ローカル構成）。失敗はログに残して task を捨てる
//! - `Broker`: DeliveryRequest を publish する。重複排除と送信は Consumer 側
//!   （キーは task の cycle から決まるので、backlog で遅れても変わらない）

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::domain::{DeliveryRequest, PipelineEvent, ReportTask, TemplateName};
use crate::domain::message::report_template_data;
use crate::error::{QueueError, SquallError};
use crate::ports::{EventSink, Notifier, Publisher, WeatherProvider};
use crate::queue::Queue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub task_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30),
            max_in_flight: 8,
        }
    }
}

/// How a finished weather report leaves the worker.
#[derive(Clone)]
pub enum DeliveryMode {
    Direct(Arc<dyn Notifier>),
    Broker {
        publisher: Arc<dyn Publisher>,
        routing_key: String,
    },
}

impl DeliveryMode {
    fn label(&self) -> &'static str {
        match self {
            DeliveryMode::Direct(_) => "direct",
            DeliveryMode::Broker { .. } => "broker",
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    weather: Arc<dyn WeatherProvider>,
    delivery: DeliveryMode,
    events: Arc<dyn EventSink>,
    config: WorkerPoolConfig,
    tracker: TaskTracker,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn Queue>,
        weather: Arc<dyn WeatherProvider>,
        delivery: DeliveryMode,
        events: Arc<dyn EventSink>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            weather,
            delivery,
            events,
            config,
            tracker: TaskTracker::new(),
        }
    }

    /// Units spawned but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Dispatch loop. Returns after every spawned unit has finished.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        tracing::info!(
            mode = self.delivery.label(),
            max_in_flight = self.config.max_in_flight,
            "worker pool started"
        );

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let task = match self.queue.dequeue(&cancel).await {
                Ok(task) => task,
                Err(QueueError::Closed) => {
                    tracing::info!("queue drained and closed");
                    break;
                }
                Err(QueueError::Cancelled) => break,
                Err(e @ QueueError::InvalidTask(_)) => {
                    tracing::error!(error = %e, "unexpected dequeue error");
                    break;
                }
            };

            let pool = Arc::clone(&self);
            self.tracker.spawn(async move {
                let _permit = permit;
                pool.run_unit(task).await;
            });
        }

        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("worker pool stopped");
    }

    /// One unit of work: timeout + panic isolation around [`WorkerPool::process`].
    async fn run_unit(&self, task: ReportTask) {
        let task_id = task.task_id();
        let limit = self.config.task_timeout;
        let unit = tokio::time::timeout(limit, self.process(&task));

        match AssertUnwindSafe(unit).catch_unwind().await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(%task_id, city = task.city(), "task completed");
                self.events.emit(PipelineEvent::TaskCompleted { task_id });
            }
            Ok(Ok(Err(e))) => {
                let kind = e.kind();
                tracing::warn!(%task_id, city = task.city(), kind = %kind, error = %e, "task dropped");
                self.events.emit(PipelineEvent::TaskFailed { task_id, kind });
            }
            Ok(Err(_elapsed)) => {
                let e = SquallError::Timeout(limit);
                tracing::warn!(%task_id, error = %e, "task timed out");
                self.events.emit(PipelineEvent::TaskFailed {
                    task_id,
                    kind: e.kind(),
                });
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(%task_id, panic = %message, "task panicked");
                self.events.emit(PipelineEvent::TaskPanicked { task_id });
            }
        }
    }

    /// Look up the weather and hand the report to the delivery mode.
    pub async fn process(&self, task: &ReportTask) -> Result<(), SquallError> {
        let report = self.weather.get_report(task.city()).await?;

        match &self.delivery {
            DeliveryMode::Direct(notifier) => {
                let data = report_template_data(task, &report);
                notifier
                    .send(task.recipient_email(), TemplateName::WeatherReport, &data)
                    .await?;
            }
            DeliveryMode::Broker {
                publisher,
                routing_key,
            } => {
                let request = DeliveryRequest::weather_report(task, &report);
                publisher.publish(routing_key, &request).await?;
                tracing::debug!(task_id = %task.task_id(), message_id = %request.message_id, "delivery request published");
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use ulid::Ulid;

    use super::*;
    use crate::domain::{ErrorKind, Frequency, Subscriber, TaskId, WeatherReport};
    use crate::impls::InMemoryBroker;
    use crate::observability::CountingEventSink;
    use crate::queue::BoundedQueue;
    use crate::testing::{RecordingNotifier, ScriptedWeather};

    fn task(email: &str, city: &str) -> ReportTask {
        let noon = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        task_in_cycle(Frequency::Daily, noon, email, city)
    }

    fn task_in_cycle(
        frequency: Frequency,
        scheduled_for: DateTime<Utc>,
        email: &str,
        city: &str,
    ) -> ReportTask {
        ReportTask::new(
            TaskId::from_ulid(Ulid::new()),
            frequency,
            scheduled_for,
            Subscriber::new(email, city, format!("tok-{city}")),
        )
    }

    struct Harness {
        queue: Arc<BoundedQueue>,
        events: Arc<CountingEventSink>,
        pool: Arc<WorkerPool>,
    }

    fn harness(weather: ScriptedWeather, delivery: DeliveryMode, config: WorkerPoolConfig) -> Harness {
        let queue = Arc::new(BoundedQueue::new(16));
        let events = Arc::new(CountingEventSink::new());
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            Arc::new(weather),
            delivery,
            events.clone(),
            config,
        ));
        Harness { queue, events, pool }
    }

    #[tokio::test]
    async fn drains_the_queue_and_sends_each_report() {
        let notifier = Arc::new(RecordingNotifier::new());
        let h = harness(
            ScriptedWeather::new()
                .with("Kyiv", WeatherReport::new(21.0, 60.0, "Sunny"))
                .with("Lviv", WeatherReport::new(17.5, 80.0, "Rain")),
            DeliveryMode::Direct(notifier.clone()),
            WorkerPoolConfig::default(),
        );
        let cancel = CancellationToken::new();
        h.queue.enqueue(&cancel, task("a@x.com", "Kyiv")).await.unwrap();
        h.queue.enqueue(&cancel, task("b@x.com", "Lviv")).await.unwrap();
        h.queue.close();

        Arc::clone(&h.pool).run(cancel).await;

        let mut sent = notifier.sent();
        sent.sort_by(|a, b| a.recipient.cmp(&b.recipient));
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].data["city"], "Kyiv");
        assert_eq!(sent[1].data["description"], "Rain");
        assert_eq!(h.events.snapshot().tasks_completed, 2);
        assert_eq!(h.pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn missing_weather_drops_only_that_task() {
        let notifier = Arc::new(RecordingNotifier::new());
        let h = harness(
            ScriptedWeather::new().with("Kyiv", WeatherReport::new(21.0, 60.0, "Sunny")),
            DeliveryMode::Direct(notifier.clone()),
            WorkerPoolConfig::default(),
        );
        let cancel = CancellationToken::new();
        h.queue.enqueue(&cancel, task("a@x.com", "Atlantis")).await.unwrap();
        h.queue.enqueue(&cancel, task("b@x.com", "Kyiv")).await.unwrap();
        h.queue.close();

        Arc::clone(&h.pool).run(cancel).await;

        assert_eq!(notifier.sent().len(), 1);
        let counts = h.events.snapshot();
        assert_eq!(counts.tasks_completed, 1);
        assert_eq!(counts.tasks_failed, 1);
        assert_eq!(counts.failures_by_kind.get(&ErrorKind::Transient), Some(&1));
    }

    #[tokio::test]
    async fn panic_in_one_unit_does_not_stop_the_pool() {
        let notifier = Arc::new(RecordingNotifier::new());
        let h = harness(
            ScriptedWeather::new()
                .panicking_on("Chernobyl")
                .with("Kyiv", WeatherReport::new(21.0, 60.0, "Sunny")),
            DeliveryMode::Direct(notifier.clone()),
            WorkerPoolConfig::default(),
        );
        let cancel = CancellationToken::new();
        h.queue.enqueue(&cancel, task("a@x.com", "Chernobyl")).await.unwrap();
        h.queue.enqueue(&cancel, task("b@x.com", "Kyiv")).await.unwrap();
        h.queue.close();

        Arc::clone(&h.pool).run(cancel).await;

        let counts = h.events.snapshot();
        assert_eq!(counts.tasks_panicked, 1);
        assert_eq!(counts.tasks_completed, 1);
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_unit_is_cut_off_by_the_task_timeout() {
        let notifier = Arc::new(RecordingNotifier::new());
        let h = harness(
            ScriptedWeather::new()
                .with("Kyiv", WeatherReport::new(21.0, 60.0, "Sunny"))
                .delayed(Duration::from_secs(60)),
            DeliveryMode::Direct(notifier.clone()),
            WorkerPoolConfig {
                task_timeout: Duration::from_secs(30),
                max_in_flight: 2,
            },
        );
        let cancel = CancellationToken::new();
        h.queue.enqueue(&cancel, task("a@x.com", "Kyiv")).await.unwrap();
        h.queue.close();

        Arc::clone(&h.pool).run(cancel).await;

        assert!(notifier.sent().is_empty());
        let counts = h.events.snapshot();
        assert_eq!(counts.tasks_failed, 1);
        assert_eq!(counts.failures_by_kind.get(&ErrorKind::Transient), Some(&1));
    }

    #[tokio::test]
    async fn broker_mode_publishes_a_keyed_delivery_request() {
        let broker = InMemoryBroker::new();
        let h = harness(
            ScriptedWeather::new().with("Kyiv", WeatherReport::new(21.0, 60.0, "Sunny")),
            DeliveryMode::Broker {
                publisher: Arc::new(broker.clone()),
                routing_key: "email.weather".to_string(),
            },
            WorkerPoolConfig::default(),
        );
        let cancel = CancellationToken::new();
        h.queue.enqueue(&cancel, task("A@x.com", "Kyiv")).await.unwrap();
        h.queue.close();

        Arc::clone(&h.pool).run(cancel).await;

        let requests = broker.ready_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].message_id.as_str(),
            "weather_report:daily:20260301:a@x.com"
        );
        assert_eq!(requests[0].template_name, TemplateName::WeatherReport);
        assert_eq!(broker.ready_routing_keys(), vec!["email.weather".to_string()]);
    }

    #[tokio::test]
    async fn backlogged_task_keeps_its_own_cycle_key() {
        let broker = InMemoryBroker::new();
        let h = harness(
            ScriptedWeather::new().with("Kyiv", WeatherReport::new(9.0, 70.0, "Fog")),
            DeliveryMode::Broker {
                publisher: Arc::new(broker.clone()),
                routing_key: "email.weather".to_string(),
            },
            WorkerPoolConfig::default(),
        );
        let ten = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let eleven = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap();
        let cancel = CancellationToken::new();
        // 10:00 の task が backlog で 11:00 の task と同時に処理される
        h.queue
            .enqueue(&cancel, task_in_cycle(Frequency::Hourly, ten, "a@x.com", "Kyiv"))
            .await
            .unwrap();
        h.queue
            .enqueue(&cancel, task_in_cycle(Frequency::Hourly, eleven, "a@x.com", "Kyiv"))
            .await
            .unwrap();
        h.queue.close();

        Arc::clone(&h.pool).run(cancel).await;

        let mut ids: Vec<String> = broker
            .ready_requests()
            .iter()
            .map(|r| r.message_id.as_str().to_string())
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                "weather_report:hourly:2026030110:a@x.com".to_string(),
                "weather_report:hourly:2026030111:a@x.com".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn cancel_stops_the_loop_while_idle() {
        let h = harness(
            ScriptedWeather::new(),
            DeliveryMode::Direct(Arc::new(RecordingNotifier::new())),
            WorkerPoolConfig::default(),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&h.pool).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        run.await.unwrap();
        assert!(!h.queue.is_closed());
    }
}
