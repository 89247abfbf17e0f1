//! Test doubles for the collaborator ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Frequency, MessageId, Subscriber, TemplateData, TemplateName, WeatherReport};
use crate::error::{PortError, StoreError};
use crate::ports::{IdempotencyStore, Notifier, SubscriberDirectory, WeatherProvider};

/// Poll `condition` until it holds; panics after `limit`.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not met within {limit:?}");
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub recipient: String,
    pub template: TemplateName,
    pub data: TemplateData,
}

/// Notifier that records every successful send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentMessage>>,
    delay: Option<Duration>,
    failures_left: AtomicUsize,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The first `n` sends fail.
    pub fn failing_times(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateName,
        data: &TemplateData,
    ) -> Result<(), PortError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PortError::Failed("smtp 451 try again later".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentMessage {
                recipient: recipient.to_string(),
                template,
                data: data.clone(),
            });
        Ok(())
    }
}

/// Weather provider with canned reports per city.
#[derive(Default)]
pub struct ScriptedWeather {
    reports: HashMap<String, WeatherReport>,
    panic_city: Option<String>,
    delay: Option<Duration>,
}

impl ScriptedWeather {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, city: &str, report: WeatherReport) -> Self {
        self.reports.insert(city.to_string(), report);
        self
    }

    pub fn panicking_on(mut self, city: &str) -> Self {
        self.panic_city = Some(city.to_string());
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl WeatherProvider for ScriptedWeather {
    async fn get_report(&self, city: &str) -> Result<WeatherReport, PortError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_city.as_deref() == Some(city) {
            panic!("weather provider blew up for {city}");
        }
        self.reports
            .get(city)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("no weather for {city}")))
    }
}

/// Subscriber directory backed by a fixed list.
#[derive(Default)]
pub struct StaticDirectory {
    subscribers: Vec<(Frequency, Subscriber)>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, frequency: Frequency, subscriber: Subscriber) -> Self {
        self.subscribers.push((frequency, subscriber));
        self
    }
}

#[async_trait]
impl SubscriberDirectory for StaticDirectory {
    async fn list_eligible(&self, frequency: Frequency) -> Result<Vec<Subscriber>, PortError> {
        Ok(self
            .subscribers
            .iter()
            .filter(|(f, _)| *f == frequency)
            .map(|(_, s)| s.clone())
            .collect())
    }
}

pub struct FailingDirectory;

#[async_trait]
impl SubscriberDirectory for FailingDirectory {
    async fn list_eligible(&self, _frequency: Frequency) -> Result<Vec<Subscriber>, PortError> {
        Err(PortError::Failed("connection refused".to_string()))
    }
}

/// Idempotency store whose backend is down.
pub struct UnavailableStore;

#[async_trait]
impl IdempotencyStore for UnavailableStore {
    async fn is_processed(&self, _id: &MessageId) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection reset".to_string()))
    }

    async fn mark_as_processing(&self, _id: &MessageId) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection reset".to_string()))
    }

    async fn mark_as_processed(&self, _id: &MessageId) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection reset".to_string()))
    }

    async fn clear_processing(&self, _id: &MessageId) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection reset".to_string()))
    }
}
