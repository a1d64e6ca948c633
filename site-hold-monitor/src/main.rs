use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod alerts;
mod config;
mod error;
mod fleet;
mod lifecycle;
mod scheduler;
mod storage;
mod thresholds;
mod types;
mod weather;

use alerts::{Dispatcher, InCabMessenger, Messenger, TwilioSms};
use config::{Config, MessageChannel};
use fleet::{FleetSessions, GeotabClient, VehicleResolver};
use lifecycle::HoldLifecycle;
use storage::SqliteStore;
use types::Site;
use weather::OpenMeteo;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.json_logs);
    tracing::info!(
        poll_interval_secs = config.poll_interval_secs,
        demo_mode = config.demo_mode,
        database = %config.database_path.display(),
        "Loaded configuration"
    );

    let store = Arc::new(SqliteStore::init(&config.database_path)?);
    if let Some(path) = &config.sites_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading sites file {}", path.display()))?;
        let sites: Vec<Site> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing sites file {}", path.display()))?;
        store.seed_sites(&sites).await?;
    }

    let fleet_api = Arc::new(
        GeotabClient::new(Duration::from_secs(config.fleet_timeout_secs))
            .context("building fleet client")?,
    );
    let sessions = Arc::new(FleetSessions::new(fleet_api, config.fleet.clone()));

    let messenger: Arc<dyn Messenger> = match &config.channel {
        MessageChannel::InCab => Arc::new(InCabMessenger::new(sessions.clone())),
        MessageChannel::Sms(twilio) => Arc::new(
            TwilioSms::new(twilio.clone(), Duration::from_secs(config.fleet_timeout_secs))
                .context("building SMS client")?,
        ),
    };

    let weather = Arc::new(
        OpenMeteo::new(
            config.weather_base_url.clone(),
            Duration::from_secs(config.weather_timeout_secs),
        )
        .context("building weather client")?,
    );

    let lifecycle = Arc::new(HoldLifecycle::new(
        store.clone(),
        weather,
        Arc::new(VehicleResolver::new(sessions.clone())),
        Dispatcher::new(messenger, store),
        config.thresholds(),
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    scheduler::run(
        lifecycle,
        sessions,
        config.poll_interval(),
        config.site_timeout(),
        cancel,
    )
    .await;
    Ok(())
}
