use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::WeatherError;
use crate::types::{Site, WeatherSnapshot};

/// WMO weather codes for an active thunderstorm.
const THUNDERSTORM_CODES: [i32; 3] = [95, 96, 99];

/// Probability used when the provider reports a storm the energy figure missed.
const THUNDERSTORM_FALLBACK_PCT: u8 = 50;

const MPS_TO_MPH: f64 = 2.23694;

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self, site: &Site) -> Result<WeatherSnapshot, WeatherError>;
}

pub struct OpenMeteo {
    client: Client,
    base_url: String,
}

impl OpenMeteo {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, WeatherError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[derive(Deserialize, Debug)]
struct ForecastResponse {
    current: CurrentConditions,
    #[serde(default)]
    hourly: Option<HourlyForecast>,
}

#[derive(Deserialize, Debug)]
struct CurrentConditions {
    time: String,
    apparent_temperature: f64,
    wind_speed_10m: f64,
    wind_gusts_10m: f64,
    weather_code: i32,
}

#[derive(Deserialize, Debug)]
struct HourlyForecast {
    #[serde(default)]
    lightning_potential: Vec<Option<f64>>,
}

#[async_trait]
impl WeatherSource for OpenMeteo {
    async fn fetch(&self, site: &Site) -> Result<WeatherSnapshot, WeatherError> {
        let raw: serde_json::Value = self
            .client
            .get(&self.base_url)
            .query(&[
                ("latitude", site.lat.to_string()),
                ("longitude", site.lng.to_string()),
                (
                    "current",
                    "temperature_2m,apparent_temperature,wind_speed_10m,wind_gusts_10m,weather_code,precipitation"
                        .to_string(),
                ),
                ("hourly", "lightning_potential".to_string()),
                ("forecast_hours", "1".to_string()),
                ("wind_speed_unit", "ms".to_string()),
                ("timezone", "auto".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!(site = %site.name, "Weather response received");

        snapshot_from_response(raw)
    }
}

fn snapshot_from_response(raw: serde_json::Value) -> Result<WeatherSnapshot, WeatherError> {
    let response: ForecastResponse = serde_json::from_value(raw.clone())?;
    let current = response.current;

    let cape = response
        .hourly
        .and_then(|h| h.lightning_potential.first().copied().flatten())
        .unwrap_or(0.0);

    Ok(WeatherSnapshot {
        timestamp: current.time,
        wind_speed_mph: round1(current.wind_speed_10m * MPS_TO_MPH),
        wind_gust_mph: round1(current.wind_gusts_10m * MPS_TO_MPH),
        apparent_temp_c: round1(current.apparent_temperature),
        weather_code: current.weather_code,
        lightning_probability_pct: lightning_probability(cape, current.weather_code),
        raw,
    })
}

/// Lightning probability from the storm-potential figure, with a floor for
/// storms the provider already reports as happening.
pub fn lightning_probability(cape: f64, weather_code: i32) -> u8 {
    let pct = cape_to_probability(cape);
    if pct < 40 && THUNDERSTORM_CODES.contains(&weather_code) {
        THUNDERSTORM_FALLBACK_PCT
    } else {
        pct
    }
}

/// Maps storm-potential energy (J/kg) onto four linear buckets, capped at 90%.
pub fn cape_to_probability(cape: f64) -> u8 {
    let cape = if cape.is_finite() { cape.max(0.0) } else { 0.0 };
    let pct = if cape < 100.0 {
        cape / 100.0 * 10.0
    } else if cape < 500.0 {
        10.0 + (cape - 100.0) / 400.0 * 20.0
    } else if cape < 1500.0 {
        30.0 + (cape - 500.0) / 1000.0 * 30.0
    } else {
        60.0 + (cape - 1500.0) / 2000.0 * 30.0
    };
    pct.round().min(90.0) as u8
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}
