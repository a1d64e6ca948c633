//! Per-site hold state machine.
//!
//! A site is either Clear (no open hold) or Active (one open hold). Each
//! cycle the pipeline fetches weather, evaluates thresholds and then opens,
//! keeps or clears the hold. A different breach while a hold is open never
//! replaces it; the open hold's own rule and duration decide when it ends.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::alerts::{Dispatcher, HoldContext};
use crate::error::PipelineError;
use crate::fleet::VehicleLocator;
use crate::storage::HoldStore;
use crate::thresholds::{self, ThresholdTable};
use crate::types::{Hold, Rule, Site, ThresholdBreach, VehicleOnSite, WeatherSnapshot};
use crate::weather::WeatherSource;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Open(ThresholdBreach),
    Keep,
    Clear,
    Steady,
}

/// Chooses the transition for one site from its open hold (if any) and the
/// current breach (if any).
pub fn decide(
    open_hold: Option<&Hold>,
    breach: Option<ThresholdBreach>,
    weather: &WeatherSnapshot,
    table: &ThresholdTable,
    now: DateTime<Utc>,
) -> Decision {
    match (open_hold.filter(|h| h.is_open()), breach) {
        (Some(hold), _) => {
            if thresholds::should_clear(
                hold.trigger_rule,
                hold.hold_duration_mins,
                hold.triggered_at,
                weather,
                table,
                now,
            ) {
                Decision::Clear
            } else {
                Decision::Keep
            }
        }
        (None, Some(breach)) => Decision::Open(breach),
        (None, None) => Decision::Steady,
    }
}

/// What happened to a site this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened {
        hold_id: Uuid,
        rule: Rule,
        vehicles: usize,
        notified: usize,
    },
    Cleared {
        hold_id: Uuid,
        notified: usize,
    },
    Unchanged {
        hold_id: Uuid,
    },
    Steady,
}

/// The outcome of assessing a site, ready to be applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Open {
        breach: ThresholdBreach,
        weather: WeatherSnapshot,
        vehicles: Vec<VehicleOnSite>,
    },
    Clear(Hold),
    Keep(Uuid),
    Steady,
}

pub struct HoldLifecycle {
    store: Arc<dyn HoldStore>,
    weather: Arc<dyn WeatherSource>,
    vehicles: Arc<dyn VehicleLocator>,
    dispatcher: Dispatcher,
    thresholds: &'static ThresholdTable,
}

impl HoldLifecycle {
    pub fn new(
        store: Arc<dyn HoldStore>,
        weather: Arc<dyn WeatherSource>,
        vehicles: Arc<dyn VehicleLocator>,
        dispatcher: Dispatcher,
        thresholds: &'static ThresholdTable,
    ) -> Self {
        Self {
            store,
            weather,
            vehicles,
            dispatcher,
            thresholds,
        }
    }

    pub fn store(&self) -> &Arc<dyn HoldStore> {
        &self.store
    }

    /// Runs one cycle of the pipeline for `site`.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn process_site(&self, site: &Site) -> Result<Transition, PipelineError> {
        let step = self.assess(site).await?;
        self.apply(site, step).await
    }

    /// Gathers everything a transition needs without changing any state:
    /// weather, the open hold, and for a new hold the vehicles on site.
    pub async fn assess(&self, site: &Site) -> Result<Step, PipelineError> {
        let (weather, open_hold) =
            tokio::join!(self.weather.fetch(site), self.store.get_open_hold(site.id));
        let weather = weather?;
        let open_hold = open_hold?;

        let breach = thresholds::evaluate(&weather, self.thresholds);
        let step = match decide(open_hold.as_ref(), breach, &weather, self.thresholds, Utc::now()) {
            Decision::Open(breach) => {
                tracing::info!(
                    site = %site.name,
                    rule = breach.rule.as_str(),
                    value = breach.value,
                    threshold = breach.threshold,
                    "Threshold breached"
                );
                let vehicles = self.vehicles.vehicles_in_zone(&site.zone_id).await?;
                tracing::info!(site = %site.name, count = vehicles.len(), "Vehicles on site");
                Step::Open {
                    breach,
                    weather,
                    vehicles,
                }
            }
            Decision::Clear => match open_hold {
                Some(hold) => Step::Clear(hold),
                None => Step::Steady,
            },
            Decision::Keep => Step::Keep(open_hold.map(|h| h.id).unwrap_or_default()),
            Decision::Steady => {
                tracing::info!(
                    site = %site.name,
                    gust_mph = weather.wind_gust_mph,
                    lightning_pct = weather.lightning_probability_pct,
                    apparent_temp_c = weather.apparent_temp_c,
                    "All clear"
                );
                Step::Steady
            }
        };
        Ok(step)
    }

    /// Carries out an assessed step. Once a hold is created or its all-clear
    /// has started, this runs through to the stored state change.
    pub async fn apply(&self, site: &Site, step: Step) -> Result<Transition, PipelineError> {
        match step {
            Step::Open {
                breach,
                weather,
                vehicles,
            } => self.open_hold(site, &weather, breach, vehicles).await,
            Step::Clear(hold) => self.clear_hold(site, hold).await,
            Step::Keep(hold_id) => {
                tracing::info!(site = %site.name, hold_id = %hold_id, "Hold still active, no change");
                Ok(Transition::Unchanged { hold_id })
            }
            Step::Steady => Ok(Transition::Steady),
        }
    }

    async fn open_hold(
        &self,
        site: &Site,
        weather: &WeatherSnapshot,
        breach: ThresholdBreach,
        vehicles: Vec<VehicleOnSite>,
    ) -> Result<Transition, PipelineError> {
        let hold = self
            .store
            .create_hold(
                site.id,
                breach.rule,
                weather,
                &vehicles,
                breach.hold_duration_mins,
            )
            .await?;

        let ctx = HoldContext {
            hold_id: hold.id,
            site_name: &site.name,
            rule: hold.trigger_rule,
            hold_duration_mins: hold.hold_duration_mins,
        };
        let records = self.dispatcher.send_hold_alerts(&ctx, &vehicles).await?;
        let notified = records.iter().filter(|r| r.is_sent()).count();
        tracing::info!(site = %site.name, hold_id = %hold.id, notified, "Hold opened");

        Ok(Transition::Opened {
            hold_id: hold.id,
            rule: hold.trigger_rule,
            vehicles: vehicles.len(),
            notified,
        })
    }

    /// Notifies the vehicles recorded when the hold opened, then closes it.
    async fn clear_hold(&self, site: &Site, hold: Hold) -> Result<Transition, PipelineError> {
        tracing::info!(site = %site.name, hold_id = %hold.id, "Conditions cleared, issuing all-clear");

        let ctx = HoldContext {
            hold_id: hold.id,
            site_name: &site.name,
            rule: hold.trigger_rule,
            hold_duration_mins: hold.hold_duration_mins,
        };
        let records = self
            .dispatcher
            .send_all_clear_alerts(&ctx, &hold.vehicles_on_site)
            .await?;
        self.store.close_hold(hold.id, &records).await?;

        let notified = records.iter().filter(|r| r.is_sent()).count();
        tracing::info!(site = %site.name, hold_id = %hold.id, notified, "All-clear issued");
        Ok(Transition::Cleared {
            hold_id: hold.id,
            notified,
        })
    }
}
