use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::thresholds::{ThresholdTable, DEMO_THRESHOLDS, PROD_THRESHOLDS};

#[derive(Debug, Clone)]
pub struct FleetCredentials {
    pub server: String,
    pub database: String,
    pub user_name: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

#[derive(Debug, Clone)]
pub enum MessageChannel {
    InCab,
    Sms(TwilioConfig),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub demo_mode: bool,
    pub database_path: PathBuf,
    /// JSON array of sites upserted at startup, if set.
    pub sites_file: Option<PathBuf>,
    pub weather_base_url: String,
    pub weather_timeout_secs: u64,
    pub fleet: FleetCredentials,
    pub fleet_timeout_secs: u64,
    pub channel: MessageChannel,
    pub site_timeout_secs: u64,
    pub json_logs: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let poll_interval_secs = get_env_var_u64("POLL_INTERVAL_MINUTES", 5) * 60;
        let demo_mode = env::var("DEMO_MODE").map(|v| v == "true").unwrap_or(false);
        let database_path = PathBuf::from(
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./holds.db".to_string()),
        );
        let sites_file = env::var("SITES_FILE").ok().filter(|v| !v.is_empty()).map(PathBuf::from);
        let weather_base_url = env::var("WEATHER_BASE_URL")
            .unwrap_or_else(|_| "https://api.open-meteo.com/v1/forecast".to_string());

        let fleet = FleetCredentials {
            server: env::var("GEOTAB_SERVER").unwrap_or_else(|_| "my.geotab.com".to_string()),
            database: required("GEOTAB_DATABASE")?,
            user_name: required("GEOTAB_USERNAME")?,
            password: required("GEOTAB_PASSWORD")?,
        };

        let channel = match env::var("MESSAGE_CHANNEL").as_deref() {
            Ok("sms") => MessageChannel::Sms(TwilioConfig {
                account_sid: required("TWILIO_ACCOUNT_SID")?,
                auth_token: required("TWILIO_AUTH_TOKEN")?,
                from_number: required("TWILIO_FROM_NUMBER")?,
            }),
            Ok("in_cab") | Err(_) => MessageChannel::InCab,
            Ok(other) => bail!("MESSAGE_CHANNEL must be `in_cab` or `sms`, got `{other}`"),
        };

        Ok(Config {
            poll_interval_secs,
            demo_mode,
            database_path,
            sites_file,
            weather_base_url,
            weather_timeout_secs: get_env_var_u64("WEATHER_TIMEOUT_SECS", 10),
            fleet,
            fleet_timeout_secs: get_env_var_u64("FLEET_TIMEOUT_SECS", 15),
            channel,
            site_timeout_secs: get_env_var_u64("SITE_TIMEOUT_SECS", 120),
            json_logs: env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false),
        })
    }

    /// The threshold preset for this process. Never varies per site.
    pub fn thresholds(&self) -> &'static ThresholdTable {
        if self.demo_mode {
            &DEMO_THRESHOLDS
        } else {
            &PROD_THRESHOLDS
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn site_timeout(&self) -> Duration {
        Duration::from_secs(self.site_timeout_secs)
    }
}

fn required(key: &str) -> Result<String> {
    let value = env::var(key).with_context(|| format!("{key} is required"))?;
    if value.is_empty() {
        bail!("{key} is required");
    }
    Ok(value)
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_numbers_fall_back_to_default() {
        env::set_var("SITE_HOLD_TEST_BAD_NUMBER", "five");
        assert_eq!(get_env_var_u64("SITE_HOLD_TEST_BAD_NUMBER", 7), 7);
        env::remove_var("SITE_HOLD_TEST_BAD_NUMBER");
    }

    #[test]
    fn required_rejects_empty_values() {
        env::set_var("SITE_HOLD_TEST_EMPTY", "");
        assert!(required("SITE_HOLD_TEST_EMPTY").is_err());
        env::remove_var("SITE_HOLD_TEST_EMPTY");
        assert!(required("SITE_HOLD_TEST_EMPTY").is_err());
    }

    #[test]
    fn demo_mode_switches_the_threshold_preset() {
        env::set_var("GEOTAB_DATABASE", "fleet_db");
        env::set_var("GEOTAB_USERNAME", "monitor@example.com");
        env::set_var("GEOTAB_PASSWORD", "secret");

        for (value, demo) in [
            (Some("true"), true),
            (Some("false"), false),
            (Some("yes"), false),
            (None, false),
        ] {
            match value {
                Some(v) => env::set_var("DEMO_MODE", v),
                None => env::remove_var("DEMO_MODE"),
            }
            let config = Config::from_env().unwrap();
            assert_eq!(config.demo_mode, demo, "DEMO_MODE={value:?}");
            let expected = if demo { &DEMO_THRESHOLDS } else { &PROD_THRESHOLDS };
            assert!(std::ptr::eq(config.thresholds(), expected), "DEMO_MODE={value:?}");
        }
        env::remove_var("DEMO_MODE");
    }
}
