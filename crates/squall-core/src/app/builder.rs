//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 必須の collaborator（subscriber directory, weather provider, delivery mode）が
//!   欠けていれば build() で BuildError を返す
//! - cron 式もここで検証する（起動後に気づかない）
//!
//! # 起動と停止
//! ```text
//! start:    trigger → dispatcher → worker pool
//! shutdown: trigger 停止 → dispatcher 終了 → queue close → worker が drain して終了 → join
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::dispatcher::Dispatcher;
use super::trigger::{CronTrigger, TriggerConfig, parse_schedule};
use super::worker_pool::{DeliveryMode, WorkerPool, WorkerPoolConfig};
use crate::domain::Frequency;
use crate::error::TriggerError;
use crate::ports::{
    Clock, EventSink, IdGenerator, Notifier, NoopEventSink, Publisher, SubscriberDirectory,
    SystemClock, UlidGenerator, WeatherProvider,
};
use crate::queue::{BoundedQueue, Queue};

/// BuildError はパイプライン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing collaborators: {0:?}. These must be provided before build().")]
    MissingCollaborators(Vec<&'static str>),

    #[error(transparent)]
    InvalidSchedule(#[from] TriggerError),
}

/// PipelineBuilder はパイプラインを構築
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new()
///     .subscriber_directory(directory)
///     .weather_provider(weather)
///     .notifier(notifier)
///     .build()?;
/// let running = pipeline.start(&cancel)?;
/// ```
pub struct PipelineBuilder {
    directory: Option<Arc<dyn SubscriberDirectory>>,
    weather: Option<Arc<dyn WeatherProvider>>,
    delivery: Option<DeliveryMode>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    events: Arc<dyn EventSink>,
    queue_capacity: usize,
    trigger: TriggerConfig,
    workers: WorkerPoolConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            directory: None,
            weather: None,
            delivery: None,
            clock: Arc::new(SystemClock),
            ids: None,
            events: Arc::new(NoopEventSink),
            queue_capacity: 100,
            trigger: TriggerConfig::default(),
            workers: WorkerPoolConfig::default(),
        }
    }

    pub fn subscriber_directory(mut self, directory: Arc<dyn SubscriberDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn weather_provider(mut self, weather: Arc<dyn WeatherProvider>) -> Self {
        self.weather = Some(weather);
        self
    }

    /// Send reports directly (local variant).
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.delivery = Some(DeliveryMode::Direct(notifier));
        self
    }

    /// Publish delivery requests to a broker instead of sending.
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>, routing_key: impl Into<String>) -> Self {
        self.delivery = Some(DeliveryMode::Broker {
            publisher,
            routing_key: routing_key.into(),
        });
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn trigger_config(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn worker_config(mut self, workers: WorkerPoolConfig) -> Self {
        self.workers = workers;
        self
    }

    /// 構築して Pipeline を生成
    ///
    /// # 検証
    /// - 必須 collaborator が全て揃っているか
    /// - hourly / daily の cron 式が解釈できるか
    pub fn build(self) -> Result<Pipeline, BuildError> {
        let mut missing = Vec::new();
        if self.directory.is_none() {
            missing.push("subscriber_directory");
        }
        if self.weather.is_none() {
            missing.push("weather_provider");
        }
        if self.delivery.is_none() {
            missing.push("notifier or publisher");
        }
        let (Some(directory), Some(weather), Some(delivery)) =
            (self.directory, self.weather, self.delivery)
        else {
            return Err(BuildError::MissingCollaborators(missing));
        };

        parse_schedule(Frequency::Hourly, &self.trigger.hourly_cron)?;
        parse_schedule(Frequency::Daily, &self.trigger.daily_cron)?;

        let ids = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))) as Arc<dyn IdGenerator>,
        };
        let queue = Arc::new(BoundedQueue::new(self.queue_capacity));

        let dispatcher = Dispatcher::new(directory, queue.clone(), ids, Arc::clone(&self.events));
        let pool = WorkerPool::new(
            queue.clone(),
            weather,
            delivery,
            Arc::clone(&self.events),
            self.workers,
        );
        let trigger = CronTrigger::new(self.trigger, self.clock, self.events);

        Ok(Pipeline {
            queue,
            trigger,
            dispatcher: Arc::new(dispatcher),
            pool: Arc::new(pool),
        })
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wired but not yet running pipeline.
pub struct Pipeline {
    queue: Arc<BoundedQueue>,
    trigger: CronTrigger,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
}

impl Pipeline {
    /// Start trigger, dispatcher and worker pool. Cancelling `cancel` stops
    /// the trigger and the dispatcher; call [`RunningPipeline::shutdown`] to drain.
    pub fn start(mut self, cancel: &CancellationToken) -> Result<RunningPipeline, TriggerError> {
        let cancel = cancel.child_token();

        self.trigger.start(&cancel)?;
        let fires = self.trigger.events().ok_or(TriggerError::AlreadyStarted)?;

        let dispatcher = {
            let dispatcher = Arc::clone(&self.dispatcher);
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel, fires).await })
        };
        // worker は root の cancel では止めない（queue close で drain して終わる）
        let workers = tokio::spawn(Arc::clone(&self.pool).run(CancellationToken::new()));

        tracing::info!(queue_capacity = self.queue.capacity(), "pipeline started");
        Ok(RunningPipeline {
            cancel,
            queue: self.queue,
            trigger: self.trigger,
            dispatcher,
            workers,
        })
    }
}

pub struct RunningPipeline {
    cancel: CancellationToken,
    queue: Arc<BoundedQueue>,
    trigger: CronTrigger,
    dispatcher: JoinHandle<()>,
    workers: JoinHandle<()>,
}

impl RunningPipeline {
    /// Fire `frequency` now, as if its schedule had come due.
    pub async fn fire(&self, frequency: Frequency) -> bool {
        self.trigger.fire(&self.cancel, frequency).await
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Graceful shutdown in dependency order.
    pub async fn shutdown(mut self) {
        tracing::info!("pipeline shutting down");
        self.cancel.cancel();
        self.trigger.stop().await;

        if let Err(e) = self.dispatcher.await {
            tracing::error!(error = %e, "dispatcher task failed");
        }

        self.queue.close();
        if let Err(e) = self.workers.await {
            tracing::error!(error = %e, "worker pool task failed");
        }
        tracing::info!("pipeline stopped");
    }
}
