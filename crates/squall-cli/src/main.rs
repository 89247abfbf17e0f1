mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use squall_core::app::{Consumer, PipelineBuilder};
use squall_core::breaker::CircuitBreaker;
use squall_core::domain::Frequency;
use squall_core::observability::{CountingEventSink, PipelineCounts, init_tracing};
use squall_core::ports::{
    Clock, DeliverySource, IdempotencyStore, Notifier, Publisher, SystemClock,
};
use squall_core::SquallConfig;

use crate::demo::{DemoDirectory, DemoWeather, LoggingNotifier};

#[derive(Parser)]
#[command(name = "squall", about = "Scheduled weather-report delivery pipeline")]
struct Cli {
    /// TOML config file (defaults apply when omitted)
    #[arg(long, global = true, env = "SQUALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run trigger, dispatcher and workers until Ctrl-C
    Run {
        /// Fire this frequency once right after start
        #[arg(long)]
        fire: Option<Frequency>,

        /// Exit once the fired cycle has been processed
        #[arg(long, requires = "fire")]
        once: bool,
    },
    /// Load and validate the config, then print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SquallConfig::load(cli.config.as_deref()).context("loading config")?;
    init_tracing(config.log.format);

    match cli.command {
        Command::Run { fire, once } => run(config, fire, once).await,
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: SquallConfig, fire: Option<Frequency>, once: bool) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = Arc::new(CountingEventSink::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);
    let cancel = CancellationToken::new();

    let builder = PipelineBuilder::new()
        .subscriber_directory(Arc::new(DemoDirectory::default()))
        .weather_provider(Arc::new(DemoWeather))
        .clock(Arc::clone(&clock))
        .event_sink(events.clone())
        .queue_capacity(config.queue.capacity)
        .trigger_config(config.trigger_config())
        .worker_config(config.worker_config());

    let (builder, consumer) = match &config.broker.url {
        None => (builder.notifier(notifier), None),
        Some(url) => {
            let (publisher, source) = connect_broker(url, &config).await?;
            let store = idempotency_store(&config, Arc::clone(&clock)).await?;
            let consumer = Arc::new(Consumer::new(
                store,
                Arc::new(CircuitBreaker::new(config.breaker_config(), Arc::clone(&clock))),
                notifier,
                events.clone(),
                config.consumer_config(),
            ));
            let consumer_cancel = CancellationToken::new();
            let handle = tokio::spawn(consumer.run(source, consumer_cancel.clone()));
            (
                builder.publisher(publisher, config.broker.routing_key.clone()),
                Some((handle, consumer_cancel)),
            )
        }
    };

    let pipeline = builder.build()?;
    let running = pipeline.start(&cancel)?;

    if let Some(frequency) = fire {
        if !running.fire(frequency).await {
            tracing::warn!(%frequency, "manual fire was dropped");
        }
    }

    if once {
        let brokered = consumer.is_some();
        tokio::select! {
            _ = wait_for_cycle(&events, brokered) => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        }
    } else {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        tracing::info!("Ctrl-C received");
    }

    running.shutdown().await;
    if let Some((handle, consumer_cancel)) = consumer {
        stop_consumer(handle, consumer_cancel).await;
    }

    let counts = events.snapshot();
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

fn cycle_finished(counts: &PipelineCounts, brokered: bool) -> bool {
    let dispatched = counts.cycles_dispatched + counts.cycles_aborted >= 1;
    let worked = counts.tasks_completed + counts.tasks_failed + counts.tasks_panicked
        >= counts.tasks_enqueued;
    let settled = !brokered
        || counts.messages_acked + counts.messages_rejected >= counts.tasks_completed;
    dispatched && worked && settled
}

async fn wait_for_cycle(events: &CountingEventSink, brokered: bool) {
    while !cycle_finished(&events.snapshot(), brokered) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn stop_consumer(handle: JoinHandle<()>, cancel: CancellationToken) {
    cancel.cancel();
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "consumer task failed");
    }
}

#[cfg(feature = "amqp")]
async fn connect_broker(
    url: &str,
    config: &SquallConfig,
) -> anyhow::Result<(Arc<dyn Publisher>, Arc<dyn DeliverySource>)> {
    use squall_core::impls::{AmqpBroker, AmqpTopology};

    let broker = AmqpBroker::connect(
        url,
        AmqpTopology {
            exchange: config.broker.exchange.clone(),
            queue: config.broker.queue.clone(),
            routing_key: config.broker.routing_key.clone(),
        },
    )
    .await?;
    let prefetch = u16::try_from(config.consumer.max_in_flight).unwrap_or(u16::MAX);
    let source = broker.consume("squall-consumer", prefetch).await?;
    Ok((Arc::new(broker), Arc::new(source)))
}

#[cfg(not(feature = "amqp"))]
async fn connect_broker(
    _url: &str,
    _config: &SquallConfig,
) -> anyhow::Result<(Arc<dyn Publisher>, Arc<dyn DeliverySource>)> {
    anyhow::bail!("broker.url is set but squall was built without the `amqp` feature")
}

async fn idempotency_store(
    config: &SquallConfig,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn IdempotencyStore>> {
    match &config.redis.url {
        None => {
            tracing::warn!("redis.url not set; idempotency is local to this process");
            Ok(Arc::new(squall_core::impls::InMemoryIdempotencyStore::new(
                config.idempotency_policy(),
                clock,
            )))
        }
        Some(url) => redis_store(url, config).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_store(url: &str, config: &SquallConfig) -> anyhow::Result<Arc<dyn IdempotencyStore>> {
    let store = squall_core::impls::RedisIdempotencyStore::connect(
        url,
        config.idempotency_policy(),
        Duration::from_secs(2),
    )
    .await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn redis_store(_url: &str, _config: &SquallConfig) -> anyhow::Result<Arc<dyn IdempotencyStore>> {
    anyhow::bail!("redis.url is set but squall was built without the `redis` feature")
}
