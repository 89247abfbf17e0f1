//! Demo collaborators for running the pipeline without a database, weather API or SMTP.

use async_trait::async_trait;

use squall_core::domain::{Frequency, Subscriber, TemplateData, TemplateName, WeatherReport};
use squall_core::error::PortError;
use squall_core::ports::{Notifier, SubscriberDirectory, WeatherProvider};

pub struct DemoDirectory {
    subscribers: Vec<(Frequency, Subscriber)>,
}

impl Default for DemoDirectory {
    fn default() -> Self {
        Self {
            subscribers: vec![
                (Frequency::Daily, Subscriber::new("olena@example.com", "Kyiv", "demo-kyiv")),
                (Frequency::Daily, Subscriber::new("taras@example.com", "Lviv", "demo-lviv")),
                (Frequency::Hourly, Subscriber::new("iryna@example.com", "Odesa", "demo-odesa")),
            ],
        }
    }
}

#[async_trait]
impl SubscriberDirectory for DemoDirectory {
    async fn list_eligible(&self, frequency: Frequency) -> Result<Vec<Subscriber>, PortError> {
        Ok(self
            .subscribers
            .iter()
            .filter(|(f, _)| *f == frequency)
            .map(|(_, s)| s.clone())
            .collect())
    }
}

/// Deterministic conditions derived from the city name.
pub struct DemoWeather;

#[async_trait]
impl WeatherProvider for DemoWeather {
    async fn get_report(&self, city: &str) -> Result<WeatherReport, PortError> {
        if city.trim().is_empty() {
            return Err(PortError::NotFound("empty city".to_string()));
        }
        let seed = city.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        let temperature = f64::from(seed % 35) - 5.0;
        let humidity = f64::from(40 + seed % 55);
        let description = ["Sunny", "Cloudy", "Light rain", "Windy"][(seed % 4) as usize];
        Ok(WeatherReport::new(temperature, humidity, description))
    }
}

/// Notifier that writes each message to the log.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: TemplateName,
        data: &TemplateData,
    ) -> Result<(), PortError> {
        let body = serde_json::to_string(data).map_err(|e| PortError::Failed(e.to_string()))?;
        tracing::info!(recipient, %template, %body, "email sent");
        Ok(())
    }
}
