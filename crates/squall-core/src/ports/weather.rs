//! WeatherProvider port - 天気の取得
//!
//! 実体は provider の fallback chain + cache（このクレートの外）。

use async_trait::async_trait;

use crate::domain::WeatherReport;
use crate::error::PortError;

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    /// 未知の都市は `PortError::NotFound`
    async fn get_report(&self, city: &str) -> Result<WeatherReport, PortError>;
}
