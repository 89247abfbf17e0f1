use serde::{Deserialize, Serialize};

/// Current conditions for a city, as returned by the weather provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub temperature: f64,
    pub humidity: f64,
    pub description: String,
}

impl WeatherReport {
    pub fn new(temperature: f64, humidity: f64, description: impl Into<String>) -> Self {
        Self {
            temperature,
            humidity,
            description: description.into(),
        }
    }
}
