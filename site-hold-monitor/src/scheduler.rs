//! Periodic polling loop.
//!
//! Each tick loads the active sites and spawns one pipeline task per site.
//! Results are gathered with a collect-all join: a failing, panicking or
//! stalled site is logged and counted, never allowed to abort its siblings.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::fleet::FleetSessions;
use crate::lifecycle::{HoldLifecycle, Transition};
use crate::types::Site;

#[derive(Debug, Clone, PartialEq)]
pub enum SiteOutcome {
    Completed(Transition),
    /// Weather unavailable; the site is retried next cycle.
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub sites: usize,
    pub opened: usize,
    pub cleared: usize,
    pub unchanged: usize,
    pub steady: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Vehicles captured on holds opened this cycle.
    pub vehicles_held: usize,
    /// Messages delivered this cycle.
    pub notified: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &SiteOutcome) {
        match outcome {
            SiteOutcome::Completed(Transition::Opened {
                vehicles, notified, ..
            }) => {
                self.opened += 1;
                self.vehicles_held += vehicles;
                self.notified += notified;
            }
            SiteOutcome::Completed(Transition::Cleared { notified, .. }) => {
                self.cleared += 1;
                self.notified += notified;
            }
            SiteOutcome::Completed(Transition::Unchanged { .. }) => self.unchanged += 1,
            SiteOutcome::Completed(Transition::Steady) => self.steady += 1,
            SiteOutcome::Skipped(_) => self.skipped += 1,
            SiteOutcome::Failed(_) => self.failed += 1,
        }
    }
}

fn pipeline_failure(site: &Site, error: PipelineError) -> SiteOutcome {
    match error {
        PipelineError::Weather(e) => {
            tracing::warn!(site = %site.name, error = %e, "Weather fetch failed, skipping");
            SiteOutcome::Skipped(e.to_string())
        }
        e => {
            tracing::error!(site = %site.name, error = %e, "Site pipeline failed");
            SiteOutcome::Failed(e.to_string())
        }
    }
}

/// The timeout bounds the read-only assessment. A transition that has been
/// decided is applied to completion; each send is bounded by its client.
async fn process_with_timeout(
    lifecycle: &HoldLifecycle,
    site: &Site,
    site_timeout: Duration,
) -> SiteOutcome {
    let step = match time::timeout(site_timeout, lifecycle.assess(site)).await {
        Ok(Ok(step)) => step,
        Ok(Err(e)) => return pipeline_failure(site, e),
        Err(_) => {
            tracing::error!(
                site = %site.name,
                timeout_secs = site_timeout.as_secs(),
                "Site pipeline timed out"
            );
            return SiteOutcome::Failed(format!("timed out after {}s", site_timeout.as_secs()));
        }
    };

    match lifecycle.apply(site, step).await {
        Ok(transition) => SiteOutcome::Completed(transition),
        Err(e) => pipeline_failure(site, e),
    }
}

/// Runs one monitoring cycle over every active site.
pub async fn run_cycle(lifecycle: Arc<HoldLifecycle>, site_timeout: Duration) -> CycleReport {
    tracing::info!(started_at = %Utc::now().to_rfc3339(), "Poll started");

    let sites = match lifecycle.store().list_active_sites().await {
        Ok(sites) => sites,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load sites");
            return CycleReport::default();
        }
    };
    tracing::info!(count = sites.len(), "Monitoring active sites");

    let handles = sites.iter().cloned().map(|site| {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { process_with_timeout(&lifecycle, &site, site_timeout).await })
    });
    let results = join_all(handles).await;

    let mut report = CycleReport {
        sites: sites.len(),
        ..Default::default()
    };
    for (site, result) in sites.iter().zip(results) {
        let outcome = result.unwrap_or_else(|e| {
            tracing::error!(site = %site.name, error = %e, "Site task panicked");
            SiteOutcome::Failed(e.to_string())
        });
        report.record(&outcome);
    }

    tracing::info!(
        sites = report.sites,
        opened = report.opened,
        cleared = report.cleared,
        unchanged = report.unchanged,
        steady = report.steady,
        skipped = report.skipped,
        failed = report.failed,
        notified = report.notified,
        "Poll complete"
    );
    report
}

/// Polls every `interval` until `cancel` fires. The first cycle runs
/// immediately; a slow cycle delays the next tick instead of overlapping it.
pub async fn run(
    lifecycle: Arc<HoldLifecycle>,
    sessions: Arc<FleetSessions>,
    interval: Duration,
    site_timeout: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(interval_secs = interval.as_secs(), "Monitoring agent starting");

    // Log in up front so the first breach does not pay for it.
    if let Err(e) = sessions.session().await {
        tracing::error!(error = %e, "Initial fleet authentication failed, will retry on next poll");
    }

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("Scheduler stopped");
                break;
            }
            _ = ticker.tick() => {
                run_cycle(lifecycle.clone(), site_timeout).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::tests::{vehicle, FakeMessenger};
    use crate::error::WeatherError;
    use crate::fleet::tests::{creds, FakeFleet};
    use crate::alerts::Messenger;
    use crate::error::SendError;
    use crate::lifecycle::tests::{harness, harness_with, weather, FakeLocator};
    use crate::storage::tests::site;
    use crate::storage::HoldStore;
    use crate::types::{Rule, VehicleOnSite, WeatherSnapshot};
    use crate::weather::WeatherSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn one_site_failing_does_not_stop_others() {
        let h = harness_with(
            FakeMessenger::default(),
            FakeLocator {
                vehicles: std::sync::Mutex::new(vec![vehicle("b1", Some("+15550000001"))]),
                ..Default::default()
            },
        );
        let north = site("North Yard");
        let south = site("South Yard");
        let east = site("East Yard");
        for s in [&north, &south, &east] {
            h.store.upsert_site(s).await.unwrap();
        }
        h.weather.set("North Yard", weather(0.0, 70, 20.0));
        h.weather.set("East Yard", weather(3.0, 0, 20.0));
        // South Yard has no weather: its fetch fails.

        let lifecycle = Arc::new(h.lifecycle);
        let report = run_cycle(lifecycle.clone(), Duration::from_secs(5)).await;

        assert_eq!(
            report,
            CycleReport {
                sites: 3,
                opened: 1,
                steady: 1,
                skipped: 1,
                vehicles_held: 1,
                notified: 1,
                ..Default::default()
            }
        );
        let open = h.store.get_open_hold(north.id).await.unwrap().unwrap();
        assert_eq!(open.trigger_rule, Rule::Lightning3030);
        assert!(h.store.get_open_hold(south.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_cycle_keeps_single_open_hold() {
        let h = harness();
        let north = site("North Yard");
        h.store.upsert_site(&north).await.unwrap();
        h.weather.set("North Yard", weather(35.0, 0, 20.0));

        let lifecycle = Arc::new(h.lifecycle);
        let first = run_cycle(lifecycle.clone(), Duration::from_secs(5)).await;
        assert_eq!(first.opened, 1);

        // Gusts rise past the general threshold: same hold, no escalation.
        h.weather.set("North Yard", weather(48.0, 0, 20.0));
        let second = run_cycle(lifecycle.clone(), Duration::from_secs(5)).await;
        assert_eq!(second.unchanged, 1);

        let holds = h.store.holds_for_site(north.id).await.unwrap();
        assert_eq!(holds.len(), 1);
        assert_eq!(holds[0].trigger_rule, Rule::HighWindMaterialHandling);
    }

    struct StalledWeather;

    #[async_trait]
    impl WeatherSource for StalledWeather {
        async fn fetch(&self, _site: &Site) -> Result<WeatherSnapshot, WeatherError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_site_times_out() {
        let h = harness();
        let north = site("North Yard");
        h.store.upsert_site(&north).await.unwrap();

        let lifecycle = HoldLifecycle::new(
            h.store.clone(),
            Arc::new(StalledWeather),
            h.locator.clone(),
            crate::alerts::Dispatcher::new(h.messenger.clone(), h.store.clone()),
            &crate::thresholds::PROD_THRESHOLDS,
        );
        let outcome = process_with_timeout(&lifecycle, &north, Duration::from_millis(50)).await;
        assert!(matches!(outcome, SiteOutcome::Failed(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let h = harness();
        let fleet = Arc::new(FakeFleet::default());
        let sessions = Arc::new(FleetSessions::new(fleet.clone(), creds()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        run(
            Arc::new(h.lifecycle),
            sessions,
            Duration::from_secs(300),
            Duration::from_secs(5),
            cancel,
        )
        .await;
        assert_eq!(fleet.logins.load(Ordering::SeqCst), 1);
    }

    /// Every send stalls longer than the site timeout, then fails.
    #[derive(Default)]
    struct SlowMessenger {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Messenger for SlowMessenger {
        fn address_for(&self, vehicle: &VehicleOnSite) -> Option<String> {
            vehicle.phone_number.clone()
        }

        async fn send(&self, _address: &str, _body: &str) -> Result<String, SendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            time::sleep(Duration::from_millis(150)).await;
            Err(SendError::HttpStatus(504))
        }
    }

    fn crew(count: usize) -> Vec<VehicleOnSite> {
        (0..count)
            .map(|i| vehicle(&format!("b{i}"), Some(format!("+1555000000{i}").as_str())))
            .collect()
    }

    #[tokio::test]
    async fn slow_delivery_still_closes_the_hold() {
        let h = harness();
        let north = site("North Yard");
        h.store.upsert_site(&north).await.unwrap();
        let hold = h
            .store
            .create_hold(
                north.id,
                Rule::HighWindGeneral,
                &weather(45.0, 0, 20.0),
                &crew(9),
                None,
            )
            .await
            .unwrap();
        h.weather.set("North Yard", weather(5.0, 0, 20.0));

        let messenger = Arc::new(SlowMessenger::default());
        let lifecycle = HoldLifecycle::new(
            h.store.clone(),
            h.weather.clone(),
            h.locator.clone(),
            crate::alerts::Dispatcher::new(messenger.clone(), h.store.clone()),
            &crate::thresholds::PROD_THRESHOLDS,
        );

        let outcome = process_with_timeout(&lifecycle, &north, Duration::from_millis(50)).await;
        assert_eq!(
            outcome,
            SiteOutcome::Completed(Transition::Cleared {
                hold_id: hold.id,
                notified: 0
            })
        );
        assert!(h.store.get_open_hold(north.id).await.unwrap().is_none());
        assert_eq!(messenger.attempts.load(Ordering::SeqCst), 9);
        assert_eq!(h.store.notifications_for_hold(hold.id).await.unwrap().len(), 9);

        // The next cycle has nothing left to clear.
        let again = process_with_timeout(&lifecycle, &north, Duration::from_millis(50)).await;
        assert_eq!(again, SiteOutcome::Completed(Transition::Steady));
        assert_eq!(messenger.attempts.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn slow_delivery_reaches_every_recipient_of_a_new_hold() {
        let h = harness_with(
            FakeMessenger::default(),
            FakeLocator {
                vehicles: std::sync::Mutex::new(crew(9)),
                ..Default::default()
            },
        );
        let north = site("North Yard");
        h.store.upsert_site(&north).await.unwrap();
        h.weather.set("North Yard", weather(0.0, 0, 41.0));

        let messenger = Arc::new(SlowMessenger::default());
        let lifecycle = HoldLifecycle::new(
            h.store.clone(),
            h.weather.clone(),
            h.locator.clone(),
            crate::alerts::Dispatcher::new(messenger.clone(), h.store.clone()),
            &crate::thresholds::PROD_THRESHOLDS,
        );

        let outcome = process_with_timeout(&lifecycle, &north, Duration::from_millis(50)).await;
        let hold_id = match outcome {
            SiteOutcome::Completed(Transition::Opened {
                hold_id,
                rule: Rule::ExtremeHeat,
                vehicles: 9,
                notified: 0,
            }) => hold_id,
            other => panic!("expected a new heat hold, got {other:?}"),
        };
        assert_eq!(messenger.attempts.load(Ordering::SeqCst), 9);
        let logged = h.store.notifications_for_hold(hold_id).await.unwrap();
        assert_eq!(logged.len(), 9);
        assert!(logged.iter().all(|r| r.status.starts_with("failed:")));
    }
}
