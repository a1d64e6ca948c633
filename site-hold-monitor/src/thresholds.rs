//! Threshold evaluation and hold-clearing policy.
//!
//! Rules are evaluated in the order of [`RULES`]; the first rule whose
//! measured value reaches its threshold wins. Wind rules read gust speed,
//! never sustained speed.

use chrono::{DateTime, Utc};

use crate::types::{Rule, ThresholdBreach, WeatherSnapshot};

/// Lightning holds follow the 30/30 convention.
pub const LIGHTNING_HOLD_MINS: u32 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    pub lightning_pct: f64,
    pub high_wind_general_mph: f64,
    pub high_wind_material_mph: f64,
    pub extreme_heat_c: f64,
}

pub static PROD_THRESHOLDS: ThresholdTable = ThresholdTable {
    lightning_pct: 40.0,
    high_wind_general_mph: 40.0,
    high_wind_material_mph: 30.0,
    extreme_heat_c: 38.0,
};

pub static DEMO_THRESHOLDS: ThresholdTable = ThresholdTable {
    lightning_pct: 10.0,
    high_wind_general_mph: 5.0,
    high_wind_material_mph: 2.0,
    extreme_heat_c: 10.0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Measure {
    LightningPct,
    WindGust,
    ApparentTemp,
}

impl Measure {
    fn read(self, weather: &WeatherSnapshot) -> f64 {
        match self {
            Measure::LightningPct => f64::from(weather.lightning_probability_pct),
            Measure::WindGust => weather.wind_gust_mph,
            Measure::ApparentTemp => weather.apparent_temp_c,
        }
    }
}

struct RuleDef {
    rule: Rule,
    measure: Measure,
    threshold: fn(&ThresholdTable) -> f64,
    hold_duration_mins: Option<u32>,
}

fn lightning_threshold(t: &ThresholdTable) -> f64 {
    t.lightning_pct
}

fn wind_general_threshold(t: &ThresholdTable) -> f64 {
    t.high_wind_general_mph
}

fn wind_material_threshold(t: &ThresholdTable) -> f64 {
    t.high_wind_material_mph
}

fn heat_threshold(t: &ThresholdTable) -> f64 {
    t.extreme_heat_c
}

/// Highest priority first. Wind-general precedes wind-material and has the
/// higher threshold, so at most one wind rule can match.
static RULES: [RuleDef; 4] = [
    RuleDef {
        rule: Rule::Lightning3030,
        measure: Measure::LightningPct,
        threshold: lightning_threshold,
        hold_duration_mins: Some(LIGHTNING_HOLD_MINS),
    },
    RuleDef {
        rule: Rule::HighWindGeneral,
        measure: Measure::WindGust,
        threshold: wind_general_threshold,
        hold_duration_mins: None,
    },
    RuleDef {
        rule: Rule::HighWindMaterialHandling,
        measure: Measure::WindGust,
        threshold: wind_material_threshold,
        hold_duration_mins: None,
    },
    RuleDef {
        rule: Rule::ExtremeHeat,
        measure: Measure::ApparentTemp,
        threshold: heat_threshold,
        hold_duration_mins: None,
    },
];

fn rule_def(rule: Rule) -> &'static RuleDef {
    match rule {
        Rule::Lightning3030 => &RULES[0],
        Rule::HighWindGeneral => &RULES[1],
        Rule::HighWindMaterialHandling => &RULES[2],
        Rule::ExtremeHeat => &RULES[3],
    }
}

/// Returns the highest-priority breach for this snapshot, if any.
pub fn evaluate(weather: &WeatherSnapshot, table: &ThresholdTable) -> Option<ThresholdBreach> {
    RULES.iter().find_map(|def| {
        let value = def.measure.read(weather);
        let threshold = (def.threshold)(table);
        (value >= threshold).then_some(ThresholdBreach {
            rule: def.rule,
            value,
            threshold,
            hold_duration_mins: def.hold_duration_mins,
        })
    })
}

/// Decides whether an open hold should close.
///
/// A hold with a fixed duration clears once that much time has elapsed,
/// whatever the current weather. A hold without one clears only when the
/// triggering rule's measurement is back below its threshold.
pub fn should_clear(
    rule: Rule,
    hold_duration_mins: Option<u32>,
    triggered_at: DateTime<Utc>,
    weather: &WeatherSnapshot,
    table: &ThresholdTable,
    now: DateTime<Utc>,
) -> bool {
    match hold_duration_mins {
        Some(mins) => now - triggered_at >= chrono::Duration::minutes(i64::from(mins)),
        None => {
            let def = rule_def(rule);
            def.measure.read(weather) < (def.threshold)(table)
        }
    }
}
